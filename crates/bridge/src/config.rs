use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_protocol::BridgeConfig;

const PACKAGED_DEFAULT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/config/config.default.yaml"
));

/// Resolve the config path per the `--config` rules: absent defaults to
/// `<exe-dir>/config/config.yaml`; a bare filename is placed under
/// `<exe-dir>/config/`; anything else (absolute or already a path) is used
/// as-is.
pub fn resolve_path(config_flag: Option<&str>) -> Result<PathBuf> {
    let exe_dir = std::env::current_exe()
        .context("failed to resolve current executable path")?
        .parent()
        .context("executable has no parent directory")?
        .to_path_buf();

    let path = match config_flag {
        None => exe_dir.join("config").join("config.yaml"),
        Some(flag) => {
            let candidate = Path::new(flag);
            if candidate.file_name() == Some(candidate.as_os_str()) {
                // bare filename, no directory component
                let with_ext = if candidate.extension().is_none() {
                    candidate.with_extension("yaml")
                } else {
                    candidate.to_path_buf()
                };
                exe_dir.join("config").join(with_ext)
            } else {
                candidate.to_path_buf()
            }
        }
    };
    Ok(path)
}

/// Load and validate the merged configuration at `path`, copying the
/// packaged default into place first if no user config exists yet.
pub fn load(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config found, writing packaged default");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, PACKAGED_DEFAULT)
            .with_context(|| format!("failed to write default config to {}", path.display()))?;
    }

    let default_value: serde_yaml::Value =
        serde_yaml::from_str(PACKAGED_DEFAULT).context("packaged default config is invalid")?;

    let user_contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let user_value: serde_yaml::Value =
        serde_yaml::from_str(&user_contents).context("failed to parse config YAML")?;

    let merged = deep_merge(default_value, user_value);
    let config: BridgeConfig =
        serde_yaml::from_value(merged).context("merged config does not match expected shape")?;

    config.validate().map_err(|issues| {
        let mut msg = format!("invalid configuration ({}):", path.display());
        for issue in &issues {
            msg.push_str("\n  ");
            msg.push_str(issue);
        }
        anyhow::anyhow!(msg)
    })?;

    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Recursively merge `overlay` onto `base`: mapping keys merge recursively,
/// any other value type is replaced outright by the overlay's value.
fn deep_merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match (base, overlay) {
        (Value::Mapping(mut base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_val) => deep_merge(base_val, overlay_val),
                    None => overlay_val,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packaged_default_parses_and_validates_with_a_host_override() {
        let default_value: serde_yaml::Value = serde_yaml::from_str(PACKAGED_DEFAULT).unwrap();
        let overlay: serde_yaml::Value =
            serde_yaml::from_str("mqtt:\n  host: broker.example.com\n  username: cam-1\n")
                .unwrap();
        let merged = deep_merge(default_value, overlay);
        let config: BridgeConfig = serde_yaml::from_value(merged).unwrap();
        assert_eq!(config.mqtt.host, "broker.example.com");
        assert_eq!(config.mqtt.port, 1883);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn deep_merge_preserves_untouched_sibling_keys() {
        let base: serde_yaml::Value =
            serde_yaml::from_str("mqtt:\n  host: a\n  port: 1883\ncamera:\n  fps: 15\n").unwrap();
        let overlay: serde_yaml::Value = serde_yaml::from_str("mqtt:\n  host: b\n").unwrap();
        let merged = deep_merge(base, overlay);
        let text = serde_yaml::to_string(&merged).unwrap();
        assert!(text.contains("host: b"));
        assert!(text.contains("port: 1883"));
        assert!(text.contains("fps: 15"));
    }

    #[test]
    fn resolve_path_appends_yaml_extension_to_bare_filename() {
        let resolved = resolve_path(Some("my-config")).unwrap();
        assert_eq!(resolved.file_name().unwrap(), "my-config.yaml");
        assert!(resolved.parent().unwrap().ends_with("config"));
    }

    #[test]
    fn resolve_path_uses_absolute_path_as_is() {
        let resolved = resolve_path(Some("/etc/camera-bridge/foo.yaml")).unwrap();
        assert_eq!(resolved, PathBuf::from("/etc/camera-bridge/foo.yaml"));
    }
}
