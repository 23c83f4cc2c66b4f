//! # pd-core
//!
//! Core domain models, protocol types and ports for PeerDrop.
//!
//! This crate holds no I/O: transports, storage and clocks are reached
//! through the traits in [`ports`].

pub mod config;
pub mod device;
pub mod ids;
pub mod network;
pub mod pairing;
pub mod ports;
pub mod settings;
pub mod transfer;

pub use config::AppConfig;
pub use device::{DeviceContext, DeviceDescriptor, Platform};
pub use ids::{ConnectionId, DeviceId, SessionId};
pub use network::{ConnectionError, ConnectionState, PeerEvent, SignalEnvelope, SignalKind};
pub use pairing::{PairedDeviceRecord, PairingError, PairingEvent};
pub use settings::Settings;
pub use transfer::{TransferError, TransferEvent, TransferKind, TransferMessage};
