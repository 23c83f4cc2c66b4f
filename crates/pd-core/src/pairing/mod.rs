//! Pairing domain: trust records, codes and out-of-band bootstrap inputs.

pub mod auth_code;
pub mod bootstrap;
pub mod discovered;
pub mod error;
pub mod events;
pub mod paired_device;

pub use auth_code::{normalize_code, AuthCode, AuthCodeError, AuthCodeRegistry};
pub use bootstrap::{
    descriptor_from_envelope, parse_scanned, parse_signal_blob, BootstrapInput, BootstrapParseError,
};
pub use discovered::DiscoveredDevice;
pub use error::PairingError;
pub use events::PairingEvent;
pub use paired_device::PairedDeviceRecord;
