//! Configuration DTO mapped from the node's TOML file.
//!
//! Data only: no validation and no default computation. Empty strings and
//! empty paths are valid facts; the bootstrap layer decides what they mean.

use std::path::PathBuf;

use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Stable local device id (may be empty).
    pub device_id: String,

    pub device_name: String,

    /// Platform name as written in the file (may be empty).
    pub device_platform: String,

    /// WebSocket rendezvous URL (may be empty).
    pub signaling_url: String,

    pub data_dir: PathBuf,

    pub download_dir: PathBuf,

    /// `[settings]` table if present, parsed as-is.
    pub settings: Option<Settings>,
}

impl AppConfig {
    pub fn from_toml(toml_value: &toml::Value) -> anyhow::Result<Self> {
        let string_at = |table: &str, key: &str| {
            toml_value
                .get(table)
                .and_then(|t| t.get(key))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };

        let settings = match toml_value.get("settings") {
            Some(value) => Some(value.clone().try_into::<Settings>()?),
            None => None,
        };

        Ok(Self {
            device_id: string_at("device", "id"),
            device_name: string_at("device", "name"),
            device_platform: string_at("device", "platform"),
            signaling_url: string_at("signaling", "url"),
            data_dir: PathBuf::from(string_at("storage", "data_dir")),
            download_dir: PathBuf::from(string_at("storage", "download_dir")),
            settings,
        })
    }

    pub fn empty() -> Self {
        Self {
            device_id: String::new(),
            device_name: String::new(),
            device_platform: String::new(),
            signaling_url: String::new(),
            data_dir: PathBuf::new(),
            download_dir: PathBuf::new(),
            settings: None,
        }
    }

    /// Builds paths under `data_dir`, which the caller computes with
    /// platform-specific logic (e.g. the `dirs` crate).
    pub fn with_system_defaults(data_dir: PathBuf) -> Self {
        Self {
            download_dir: data_dir.join("downloads"),
            data_dir,
            ..Self::empty()
        }
    }

    pub fn paired_devices_path(&self) -> PathBuf {
        self.data_dir.join("paired_devices.json")
    }
}
