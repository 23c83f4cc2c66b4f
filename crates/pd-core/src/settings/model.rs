use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Interval between rendezvous heartbeats.
    pub heartbeat_interval_secs: u64,

    /// How long a session may stay `connecting` before it is failed.
    pub negotiation_timeout_secs: u64,
}

impl ConnectionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub clipboard_auto_accept: bool,
    pub file_auto_accept: bool,
    pub max_clipboard_bytes: u64,
    pub max_file_bytes: u64,

    /// Chunks are only written while the session's buffered amount is at or
    /// below this mark.
    pub buffered_low_water: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingSettings {
    pub code_ttl_secs: u64,
    pub sweep_interval_secs: u64,

    /// Pair back automatically when a remote device pairs with us.
    pub auto_accept_requests: bool,

    pub max_code_attempts: u32,
}

impl PairingSettings {
    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.code_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub pairing: PairingSettings,
}

fn current_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}
