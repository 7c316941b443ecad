//! Standard locations for the settings file

use std::path::PathBuf;

/// Settings directory
///
/// Returns: `<config dir>/jacklink` (e.g. `~/.config/jacklink` on Linux),
/// or `./jacklink` when the platform has no config directory.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jacklink")
}

/// Default settings file
///
/// Returns: `<config dir>/jacklink/settings.yaml`
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("settings.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_layout() {
        let path = default_config_path();
        assert!(path.ends_with("jacklink/settings.yaml"));
        assert!(path.starts_with(default_config_dir()));
    }
}
