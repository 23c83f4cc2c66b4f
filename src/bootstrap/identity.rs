//! Turns the raw config facts into the local device identity and the
//! directories the node writes to.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pd_core::config::AppConfig;
use pd_core::device::{DeviceContext, Platform};
use pd_core::ids::DeviceId;
use tracing::info;

const APP_DIR_NAME: &str = "peerdrop";
const DEVICE_ID_FILE: &str = "device_id.txt";
const FALLBACK_DEVICE_NAME: &str = "PeerDrop Device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub paired_devices: PathBuf,
}

/// Empty `data_dir` falls back to `<local data dir>/peerdrop`, empty
/// `download_dir` to `<data_dir>/downloads`.
pub fn resolve_paths(config: &AppConfig) -> Result<NodePaths> {
    let data_dir = if config.data_dir.as_os_str().is_empty() {
        dirs::data_local_dir()
            .context("no local data directory on this platform")?
            .join(APP_DIR_NAME)
    } else {
        config.data_dir.clone()
    };

    let defaults = AppConfig::with_system_defaults(data_dir.clone());
    let download_dir = if config.download_dir.as_os_str().is_empty() {
        defaults.download_dir.clone()
    } else {
        config.download_dir.clone()
    };

    Ok(NodePaths {
        paired_devices: defaults.paired_devices_path(),
        data_dir,
        download_dir,
    })
}

/// Builds the local [`DeviceContext`].
///
/// A configured id wins. Otherwise the id stored under `data_dir` is reused,
/// or a fresh UUID is minted and stored. The name defaults to the hostname.
pub fn resolve_device(config: &AppConfig, data_dir: &Path) -> Result<DeviceContext> {
    let device_id = if config.device_id.trim().is_empty() {
        match load_device_id(data_dir)? {
            Some(id) => id,
            None => {
                let id = DeviceId::new(uuid::Uuid::new_v4().to_string());
                save_device_id(data_dir, &id)?;
                info!(device_id = %id, "minted new device id");
                id
            }
        }
    } else {
        DeviceId::new(config.device_id.trim())
    };

    let device_name = if config.device_name.trim().is_empty() {
        gethostname::gethostname()
            .to_str()
            .unwrap_or(FALLBACK_DEVICE_NAME)
            .to_string()
    } else {
        config.device_name.trim().to_string()
    };

    let platform = if config.device_platform.trim().is_empty() {
        Platform::current()
    } else {
        config.device_platform.parse().unwrap_or_default()
    };

    Ok(DeviceContext::new(device_id, device_name, platform))
}

fn load_device_id(data_dir: &Path) -> Result<Option<DeviceId>> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read device_id file failed: {}", path.display()))?;
    let id = DeviceId::new(content.trim());
    Ok((!id.is_empty()).then_some(id))
}

fn save_device_id(data_dir: &Path, id: &DeviceId) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir failed: {}", data_dir.display()))?;

    let path = data_dir.join(DEVICE_ID_FILE);
    let tmp_path = path.with_extension("txt.tmp");
    std::fs::write(&tmp_path, id.as_str())
        .with_context(|| format!("write temp device_id failed: {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, &path)
        .with_context(|| format!("rename temp device_id failed: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_values_win() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::empty();
        config.device_id = "desk-1".to_string();
        config.device_name = "Desk".to_string();
        config.device_platform = "macos".to_string();

        let ctx = resolve_device(&config, dir.path()).unwrap();

        assert_eq!(ctx.device_id, DeviceId::new("desk-1"));
        assert_eq!(ctx.device_name, "Desk");
        assert_eq!(ctx.platform, Platform::MacOS);
        assert!(!dir.path().join(DEVICE_ID_FILE).exists());
    }

    #[test]
    fn test_minted_id_is_stable_across_runs() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::empty();

        let first = resolve_device(&config, dir.path()).unwrap();
        let second = resolve_device(&config, dir.path()).unwrap();

        assert!(!first.device_id.is_empty());
        assert_eq!(first.device_id, second.device_id);
        assert!(!first.device_name.is_empty());
    }

    #[test]
    fn test_paths_derive_from_data_dir() {
        let config = AppConfig::with_system_defaults(PathBuf::from("/tmp/pd"));
        let paths = resolve_paths(&config).unwrap();

        assert_eq!(paths.data_dir, PathBuf::from("/tmp/pd"));
        assert_eq!(paths.download_dir, PathBuf::from("/tmp/pd/downloads"));
        assert_eq!(paths.paired_devices, PathBuf::from("/tmp/pd/paired_devices.json"));
    }

    #[test]
    fn test_explicit_download_dir_is_kept() {
        let mut config = AppConfig::with_system_defaults(PathBuf::from("/tmp/pd"));
        config.download_dir = PathBuf::from("/srv/inbox");
        assert_eq!(resolve_paths(&config).unwrap().download_dir, PathBuf::from("/srv/inbox"));
    }
}
