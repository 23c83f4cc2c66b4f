use pd_core::settings::Settings;
use pd_core::transfer::{TransferKind, CHUNK_SIZE};

/// Runtime knobs of the transfer engine, resolved once from settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub clipboard_auto_accept: bool,
    pub file_auto_accept: bool,
    pub max_clipboard_bytes: u64,
    pub max_file_bytes: u64,
    pub buffered_low_water: usize,
}

impl TransferConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let transfer = &settings.transfer;
        Self {
            // Receivers accept any size, but the wire contract caps chunks.
            chunk_size: transfer.chunk_size.clamp(1, CHUNK_SIZE),
            clipboard_auto_accept: transfer.clipboard_auto_accept,
            file_auto_accept: transfer.file_auto_accept,
            max_clipboard_bytes: transfer.max_clipboard_bytes,
            max_file_bytes: transfer.max_file_bytes,
            buffered_low_water: transfer.buffered_low_water,
        }
    }

    pub fn limit_for(&self, kind: TransferKind) -> u64 {
        match kind {
            TransferKind::Clipboard => self.max_clipboard_bytes,
            TransferKind::File => self.max_file_bytes,
        }
    }

    pub fn auto_accepts(&self, kind: TransferKind) -> bool {
        match kind {
            TransferKind::Clipboard => self.clipboard_auto_accept,
            TransferKind::File => self.file_auto_accept,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
