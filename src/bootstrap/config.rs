//! Configuration loading.
//!
//! Pure data loading: the file is read and mapped onto [`AppConfig`] as-is.
//! Empty values are facts; [`super::identity`] decides what they mean.

use std::path::{Path, PathBuf};

use anyhow::Context;
use pd_core::config::AppConfig;
use tracing::debug;

const APP_DIR_NAME: &str = "peerdrop";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Load configuration from a TOML file.
///
/// # Errors
///
/// Returns error if the file cannot be read, is not valid TOML, or carries a
/// `[settings]` table that does not map onto `Settings`.
pub fn load_config(config_path: &Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let toml_value: toml::Value = toml::from_str(&content).context("Failed to parse config as TOML")?;
    AppConfig::from_toml(&toml_value)
        .with_context(|| format!("Failed to map config file: {}", config_path.display()))
}

/// `<config dir>/peerdrop/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// An explicit path must exist. Without one, the default location is tried
/// and a missing file yields an empty config.
pub fn load_config_or_default(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    if let Some(path) = explicit {
        return load_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => load_config(&path),
        other => {
            debug!(path = ?other, "no config file, using defaults");
            Ok(AppConfig::empty())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config_reads_valid_toml() {
        let file = write_config(
            r#"
            [device]
            id = "desk-1"
            name = "Desk"

            [signaling]
            url = "ws://127.0.0.1:9000/ws"

            [settings.pairing]
            auto_accept_requests = false
            "#,
        );

        let config = load_config(file.path()).unwrap();

        assert_eq!(config.device_id, "desk-1");
        assert_eq!(config.signaling_url, "ws://127.0.0.1:9000/ws");
        assert!(!config.settings.unwrap().pairing.auto_accept_requests);
    }

    #[test]
    fn test_load_config_does_not_fill_defaults() {
        let file = write_config("[device]\n");
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.device_name, "");
        assert_eq!(config.data_dir, PathBuf::new());
    }

    #[test]
    fn test_load_config_rejects_invalid_toml() {
        let file = write_config("[device\nid = ");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config_or_default(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("nope.toml"));
    }
}
