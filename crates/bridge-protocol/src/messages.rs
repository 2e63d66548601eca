use serde::{Deserialize, Serialize};

/// SDP offer or answer exchanged over `<device>/sdp/<viewer>[/offer]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpMessage {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpMessage {
    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// ICE candidate exchanged over `<device>/ice/<viewer>[/offer]`.
///
/// `candidate: None` is the end-of-candidates sentinel: it MUST be ignored on
/// receive and published exactly once per session when local gathering
/// completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceMessage {
    pub candidate: Option<String>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceMessage {
    /// The end-of-candidates sentinel published once gathering completes.
    pub fn end_of_candidates() -> Self {
        Self {
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_none()
    }
}

/// Heartbeat published on `device/<device>/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub device_id: String,
    pub device_type: String,
    pub ts: u64,
    pub status: StatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_ready: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Alive,
    Shutdown,
}

impl StatusMessage {
    pub fn alive(device_id: impl Into<String>, ts: u64, camera_ready: bool) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: "camera".to_string(),
            ts,
            status: StatusKind::Alive,
            camera_ready: Some(camera_ready),
        }
    }

    pub fn shutdown(device_id: impl Into<String>, ts: u64) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: "camera".to_string(),
            ts,
            status: StatusKind::Shutdown,
            camera_ready: None,
        }
    }
}

/// One ICE/STUN/TURN server entry from `mqtt.ice_servers[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(
        rename = "credentialType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdp_answer_serializes_with_lowercase_type() {
        let msg = SdpMessage::answer("v=0\r\n...".to_string());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"answer""#));
        assert!(json.contains(r#""sdp":"v=0\r\n...""#));
    }

    #[test]
    fn sdp_offer_roundtrip() {
        let json = r#"{"type":"offer","sdp":"v=0\n..."}"#;
        let msg: SdpMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, SdpKind::Offer);
        assert_eq!(msg.sdp, "v=0\n...");
    }

    #[test]
    fn end_of_candidates_has_null_candidate() {
        let msg = IceMessage::end_of_candidates();
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"candidate":null}"#);
        assert!(msg.is_end_of_candidates());
    }

    #[test]
    fn ice_candidate_from_browser_style_payload() {
        let json = r#"{"candidate":"candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let msg: IceMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_end_of_candidates());
        assert_eq!(msg.sdp_mid.as_deref(), Some("0"));
        assert_eq!(msg.sdp_mline_index, Some(0));
    }

    #[test]
    fn status_alive_has_required_keys() {
        let msg = StatusMessage::alive("abc123", 1_700_000_000, true);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""device_id":"abc123""#));
        assert!(json.contains(r#""device_type":"camera""#));
        assert!(json.contains(r#""status":"alive""#));
        assert!(json.contains(r#""camera_ready":true"#));
    }

    #[test]
    fn status_shutdown_omits_camera_ready() {
        let msg = StatusMessage::shutdown("abc123", 1_700_000_000);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""status":"shutdown""#));
        assert!(!json.contains("camera_ready"));
    }

    #[test]
    fn ice_server_entry_without_credentials() {
        let json = r#"{"urls":["stun:stun.l.google.com:19302"]}"#;
        let entry: IceServerEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(entry.username.is_none());
    }
}
