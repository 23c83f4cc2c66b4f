//! Dependency grouping for [`App`](crate::App) construction.
//!
//! Plain parameter grouping: no build steps, no defaults, no hidden logic.

use std::sync::Arc;

use pd_core::ports::{ClockPort, PairedDeviceRepositoryPort, PeerConnectionPort, TransferSinkPort};

/// Every port the use cases need. All fields are required.
pub struct AppDeps {
    // Network
    pub connections: Arc<dyn PeerConnectionPort>,

    // Storage
    pub paired_devices: Arc<dyn PairedDeviceRepositoryPort>,

    // Sinks for received content
    pub clipboard_sink: Arc<dyn TransferSinkPort>,
    pub file_sink: Arc<dyn TransferSinkPort>,

    // System
    pub clock: Arc<dyn ClockPort>,
}
