use md5::{Digest, Md5};

/// Derive the bridge's stable device id: the first 16 hex digits of the
/// MD5 digest of the RTSP URL.
pub fn derive_device_id(rtsp_url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(rtsp_url.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().fold(String::with_capacity(32), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    });
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_pure_and_deterministic() {
        let a = derive_device_id("rtsp://203.0.113.1/stream");
        let b = derive_device_id("rtsp://203.0.113.1/stream");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn device_id_matches_known_digest_prefix() {
        // First 8 hex digits of MD5("rtsp://203.0.113.1/stream")
        let id = derive_device_id("rtsp://203.0.113.1/stream");
        let mut hasher = Md5::new();
        hasher.update(b"rtsp://203.0.113.1/stream");
        let digest = hasher.finalize();
        let full_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(&id[..8], &full_hex[..8]);
    }

    #[test]
    fn different_urls_produce_different_ids() {
        let a = derive_device_id("rtsp://camera-a.local/stream");
        let b = derive_device_id("rtsp://camera-b.local/stream");
        assert_ne!(a, b);
    }
}
