use thiserror::Error;

/// Typed domain errors for the bridge's configuration and runtime layers.
///
/// Call sites that need contextual wrapping (file I/O, SDP parsing) reach for
/// `anyhow::Context` instead; this enum only covers errors a caller might
/// reasonably match on.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Not reachable in practice (MD5 digest derivation cannot fail), kept
    /// for exhaustiveness at the exit-code boundary (see EXIT_DEVICE_ID_FAILURE).
    #[error("failed to derive device id: {0}")]
    DeviceId(String),

    #[error("mqtt transport error: {0}")]
    Mqtt(String),

    #[error("upstream source error: {0}")]
    Source(String),

    #[error("peer session error: {0}")]
    Peer(String),
}

/// Process exit code for an invalid configuration (see SPEC §6).
pub const EXIT_INVALID_CONFIG: i32 = 1;
/// Process exit code when the device id cannot be derived.
pub const EXIT_DEVICE_ID_FAILURE: i32 = 104;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_readable() {
        let err = BridgeError::Config("mqtt.host is required".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: mqtt.host is required"
        );
    }
}
