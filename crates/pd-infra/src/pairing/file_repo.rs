use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use pd_core::ids::DeviceId;
use pd_core::pairing::PairedDeviceRecord;
use pd_core::ports::{PairedDeviceRepositoryError, PairedDeviceRepositoryPort};

const CURRENT_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PairedDevicesFile {
    #[serde(default = "current_file_version")]
    version: u32,
    #[serde(default)]
    devices: Vec<PairedDeviceRecord>,
}

fn current_file_version() -> u32 {
    CURRENT_FILE_VERSION
}

/// Paired devices kept as one JSON document, rewritten on every change.
pub struct JsonFilePairedDeviceRepository {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonFilePairedDeviceRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<PairedDeviceRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("read paired devices failed: {}", self.path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let file: PairedDevicesFile = serde_json::from_str(&content)
            .with_context(|| format!("parse paired devices failed: {}", self.path.display()))?;
        Ok(file.devices)
    }

    /// Writes to a sibling temp file and renames it over the target.
    async fn write_all(&self, devices: Vec<PairedDeviceRecord>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create paired devices dir failed: {}", dir.display()))?;
        }

        let file = PairedDevicesFile {
            version: CURRENT_FILE_VERSION,
            devices,
        };
        let content = serde_json::to_string_pretty(&file).context("serialize paired devices failed")?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .await
            .with_context(|| format!("write temp paired devices failed: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path).await.with_context(|| {
            format!(
                "rename temp paired devices failed: {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        debug!(path = %self.path.display(), devices = file.devices.len(), "paired devices written");
        Ok(())
    }
}

fn storage_error(error: anyhow::Error) -> PairedDeviceRepositoryError {
    PairedDeviceRepositoryError::Storage(format!("{error:#}"))
}

#[async_trait]
impl PairedDeviceRepositoryPort for JsonFilePairedDeviceRepository {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<PairedDeviceRecord>, PairedDeviceRepositoryError> {
        let devices = self.read_all().await.map_err(storage_error)?;
        Ok(devices.into_iter().find(|d| &d.device_id == device_id))
    }

    async fn list_all(&self) -> Result<Vec<PairedDeviceRecord>, PairedDeviceRepositoryError> {
        self.read_all().await.map_err(storage_error)
    }

    async fn upsert(&self, record: PairedDeviceRecord) -> Result<(), PairedDeviceRepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.read_all().await.map_err(storage_error)?;
        match devices.iter_mut().find(|d| d.device_id == record.device_id) {
            Some(existing) => *existing = record,
            None => devices.push(record),
        }
        self.write_all(devices).await.map_err(storage_error)
    }

    async fn delete(&self, device_id: &DeviceId) -> Result<(), PairedDeviceRepositoryError> {
        let _guard = self.write_lock.lock().await;
        let mut devices = self.read_all().await.map_err(storage_error)?;
        let before = devices.len();
        devices.retain(|d| &d.device_id != device_id);
        if devices.len() == before {
            return Ok(());
        }
        self.write_all(devices).await.map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pd_core::device::{DeviceDescriptor, Platform};
    use tempfile::TempDir;

    fn record(id: &str, name: &str) -> PairedDeviceRecord {
        PairedDeviceRecord::from_descriptor(DeviceDescriptor::new(id, name, Platform::Android), Utc::now())
    }

    #[tokio::test]
    async fn test_missing_file_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFilePairedDeviceRepository::new(dir.path().join("paired_devices.json"));
        assert!(repo.list_all().await.unwrap().is_empty());
        assert!(repo.get(&"x".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_record() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFilePairedDeviceRepository::new(dir.path().join("paired_devices.json"));

        repo.upsert(record("phone", "Old")).await.unwrap();
        repo.upsert(record("phone", "New")).await.unwrap();
        repo.upsert(record("tablet", "Tab")).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(repo.get(&"phone".into()).await.unwrap().unwrap().name, "New");
    }

    #[tokio::test]
    async fn test_records_survive_a_new_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("paired_devices.json");
        JsonFilePairedDeviceRepository::new(&path)
            .upsert(record("phone", "Pixel"))
            .await
            .unwrap();

        let reopened = JsonFilePairedDeviceRepository::new(&path);
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all, vec![record_like(&all[0], "phone", "Pixel")]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    fn record_like(stored: &PairedDeviceRecord, id: &str, name: &str) -> PairedDeviceRecord {
        PairedDeviceRecord {
            device_id: id.into(),
            name: name.to_string(),
            platform: Platform::Android,
            paired_at: stored.paired_at,
        }
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFilePairedDeviceRepository::new(dir.path().join("paired_devices.json"));
        repo.upsert(record("phone", "Pixel")).await.unwrap();

        repo.delete(&"ghost".into()).await.unwrap();
        repo.delete(&"phone".into()).await.unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("paired_devices.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = JsonFilePairedDeviceRepository::new(&path).list_all().await.unwrap_err();
        assert!(matches!(err, PairedDeviceRepositoryError::Storage(_)));
    }
}
