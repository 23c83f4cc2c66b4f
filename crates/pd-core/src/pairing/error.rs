use thiserror::Error;

use super::bootstrap::BootstrapParseError;
use crate::ids::DeviceId;
use crate::network::ConnectionError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PairingError {
    /// A typed code did not validate. `reason` is one of `not_found`,
    /// `already_used`, `expired`.
    #[error("invalid pairing code: {reason}")]
    InvalidCode { reason: String },

    #[error(transparent)]
    Bootstrap(#[from] BootstrapParseError),

    #[error("cannot pair with the local device")]
    SelfPairing,

    #[error("no pending pairing request from {0}")]
    NoPendingRequest(DeviceId),

    #[error("no device to send the pairing code to")]
    NoCodeTarget,

    #[error("pairing code could not be issued: {0}")]
    CodeUnavailable(String),

    #[error("paired device storage failed: {0}")]
    Repository(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
