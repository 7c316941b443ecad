//! YAML settings I/O
//!
//! Works with any serializable settings type. A missing or unreadable file
//! is never fatal: the bridge falls back to defaults and keeps going.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Load settings from a YAML file
///
/// If the file doesn't exist, returns the default.
/// If the file exists but is invalid, logs a warning and returns the default.
///
/// # Example
///
/// ```ignore
/// let settings: LinkSettings = load_config(&Path::new("settings.yaml"));
/// ```
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Settings file doesn't exist, using defaults");
        return T::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::warn!("load_config: Failed to read {:?}: {}, using defaults", path, e);
            return T::default();
        }
    };

    match serde_yaml::from_str::<T>(&contents) {
        Ok(config) => {
            log::info!("load_config: Loaded settings from {:?}", path);
            config
        }
        Err(e) => {
            log::warn!("load_config: Failed to parse {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save settings to a YAML file
///
/// Creates parent directories if they don't exist.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize settings to YAML")?;
    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write settings file: {:?}", path))?;

    log::debug!("save_config: Settings saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkSettings;
    use crate::convert::{ChannelMapPolicy, ResamplePolicy};

    #[test]
    fn test_load_nonexistent_returns_default() {
        let settings: LinkSettings = load_config(Path::new("/nonexistent/jacklink/settings.yaml"));
        assert_eq!(settings, LinkSettings::default());
    }

    #[test]
    fn test_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.yaml");

        let mut settings = LinkSettings::default();
        settings.client_name = "studio".to_string();
        settings.server_name = Some("remote".to_string());
        settings.output_ports = 4;
        settings.channel_mapping = ChannelMapPolicy::Strict;
        settings.resampler = ResamplePolicy::Sinc;
        settings.server.auto_start = true;
        settings.server.buffer_size = 128;

        save_config(&settings, &path).unwrap();
        let loaded: LinkSettings = load_config(&path);
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "client_name: partial\nserver:\n  sample_rate: 44100\n").unwrap();

        let loaded: LinkSettings = load_config(&path);
        assert_eq!(loaded.client_name, "partial");
        assert_eq!(loaded.server.sample_rate, 44100);
        assert_eq!(loaded.server.buffer_size, LinkSettings::default().server.buffer_size);
        assert_eq!(loaded.input_ports, 2);
    }

    #[test]
    fn test_invalid_yaml_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "input_ports: [not, a, number]\n").unwrap();

        let loaded: LinkSettings = load_config(&path);
        assert_eq!(loaded, LinkSettings::default());
    }
}
