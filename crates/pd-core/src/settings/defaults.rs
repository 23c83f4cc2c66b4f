use super::model::*;
use crate::pairing::auth_code::{DEFAULT_CODE_TTL_SECS, DEFAULT_MAX_GENERATE_ATTEMPTS};
use crate::transfer::CHUNK_SIZE;

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            negotiation_timeout_secs: 30,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            clipboard_auto_accept: true,
            file_auto_accept: false,
            max_clipboard_bytes: 5 * 1024 * 1024,
            max_file_bytes: 100 * 1024 * 1024,
            buffered_low_water: 256 * 1024,
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            code_ttl_secs: DEFAULT_CODE_TTL_SECS as u64,
            sweep_interval_secs: 60,
            auto_accept_requests: true,
            max_code_attempts: DEFAULT_MAX_GENERATE_ATTEMPTS,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            connection: ConnectionSettings::default(),
            transfer: TransferSettings::default(),
            pairing: PairingSettings::default(),
        }
    }
}
