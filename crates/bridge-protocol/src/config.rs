use serde::{Deserialize, Serialize};

use crate::IceServerEntry;

/// Top-level bridge configuration, loaded from YAML (see `config::load` in
/// the bridge binary crate for the file-resolution and merge-over-default
/// procedure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub camera: CameraConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// "tcp" or "websockets"; the latter enables TLS and a WS upgrade path.
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    pub video_width: Option<u32>,
    pub video_height: Option<u32>,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            username: String::new(),
            password: String::new(),
            transport: default_transport(),
            ws_path: default_ws_path(),
            keepalive: default_keepalive(),
            protocol: default_protocol(),
            ice_servers: Vec::new(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: default_reconnect_interval(),
            video_width: None,
            video_height: None,
            fps: default_fps(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Validate the merged configuration, returning every issue found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, bridge should not start) or
    /// "WARNING:" (advisory). `mqtt.host`/`mqtt.port`/`mqtt.username` missing
    /// are configuration errors per the connection-settings contract.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.mqtt.host.trim().is_empty() {
            issues.push("ERROR: mqtt.host is required.".to_string());
        }
        if self.mqtt.port == 0 {
            issues.push("ERROR: mqtt.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.mqtt.username.trim().is_empty() {
            issues.push("ERROR: mqtt.username is required.".to_string());
        }
        if self.mqtt.transport != "tcp" && self.mqtt.transport != "websockets" {
            issues.push(format!(
                "ERROR: mqtt.transport must be 'tcp' or 'websockets', got '{}'.",
                self.mqtt.transport
            ));
        }
        if self.mqtt.keepalive == 0 {
            issues.push(
                "WARNING: mqtt.keepalive is 0; the broker connection may be dropped as idle."
                    .to_string(),
            );
        }
        for entry in &self.mqtt.ice_servers {
            for url in &entry.urls {
                let known_scheme = url.starts_with("stun:")
                    || url.starts_with("stuns:")
                    || url.starts_with("turn:")
                    || url.starts_with("turns:");
                if !known_scheme {
                    issues.push(format!(
                        "ERROR: ice_servers url '{url}' must start with stun:, stuns:, turn:, or turns:."
                    ));
                }
            }
        }

        if self.camera.reconnect_interval == 0 {
            issues.push("ERROR: camera.reconnect_interval must be >= 1 second.".to_string());
        }
        if self.camera.fps == 0 || self.camera.fps > 240 {
            issues.push(format!(
                "ERROR: camera.fps must be between 1 and 240, got {}.",
                self.camera.fps
            ));
        }
        if let Some(w) = self.camera.video_width
            && w < 160
        {
            issues.push(format!(
                "WARNING: camera.video_width is unusually small ({w}px)."
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    /// The ICE server list to pass to a peer connection, falling back to the
    /// default public STUN server when none are configured (see §6).
    pub fn ice_servers(&self) -> Vec<IceServerEntry> {
        if self.mqtt.ice_servers.is_empty() {
            vec![IceServerEntry {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
                credential_type: None,
            }]
        } else {
            self.mqtt.ice_servers.clone()
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_ws_path() -> String {
    "/mqtt".to_string()
}
fn default_keepalive() -> u16 {
    20
}
fn default_protocol() -> String {
    "3.1.1".to_string()
}
fn default_reconnect_interval() -> u64 {
    30
}
fn default_fps() -> u32 {
    15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_yaml() {
        let config: BridgeConfig = serde_yaml::from_str("").unwrap();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.transport, "tcp");
        assert_eq!(config.mqtt.ws_path, "/mqtt");
        assert_eq!(config.mqtt.keepalive, 20);
        assert!(config.mqtt.ice_servers.is_empty());
        assert_eq!(config.camera.reconnect_interval, 30);
        assert_eq!(config.camera.fps, 15);
        assert!(config.camera.video_width.is_none());
    }

    #[test]
    fn partial_yaml_only_mqtt_section() {
        let yaml = "mqtt:\n  host: broker.example.com\n  port: 8883\n";
        let config: BridgeConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mqtt.host, "broker.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.transport, "tcp");
        assert_eq!(config.camera.fps, 15);
    }

    fn valid_config() -> BridgeConfig {
        BridgeConfig {
            mqtt: MqttConfig {
                host: "broker.example.com".to_string(),
                username: "device".to_string(),
                ..MqttConfig::default()
            },
            camera: CameraConfig::default(),
        }
    }

    #[test]
    fn validate_default_values_still_needs_host_and_username() {
        let config = BridgeConfig::default();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("mqtt.host")));
        assert!(issues.iter().any(|i| i.contains("mqtt.username")));
    }

    #[test]
    fn validate_filled_in_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_bad_transport_is_error() {
        let mut config = valid_config();
        config.mqtt.transport = "udp".to_string();
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("mqtt.transport")));
    }

    #[test]
    fn validate_fps_zero_is_error() {
        let mut config = valid_config();
        config.camera.fps = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("fps")));
    }

    #[test]
    fn validate_reconnect_interval_zero_is_error() {
        let mut config = valid_config();
        config.camera.reconnect_interval = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("reconnect_interval")));
    }

    #[test]
    fn validate_bad_ice_server_scheme_is_error() {
        let mut config = valid_config();
        config.mqtt.ice_servers.push(IceServerEntry {
            urls: vec!["http://example.com".to_string()],
            username: None,
            credential: None,
            credential_type: None,
        });
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("ice_servers")));
    }

    #[test]
    fn ice_servers_falls_back_to_default_stun() {
        let config = valid_config();
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[0], "stun:stun.l.google.com:19302");
    }

    #[test]
    fn ice_servers_returns_configured_list_when_present() {
        let mut config = valid_config();
        config.mqtt.ice_servers.push(IceServerEntry {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: Some("u".to_string()),
            credential: Some("p".to_string()),
            credential_type: None,
        });
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[0], "turn:turn.example.com:3478");
    }
}
