use thiserror::Error;

use super::protocol::TransferKind;
use super::session::TransferStatus;
use crate::ids::{DeviceId, SessionId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Malformed or out-of-sequence message; mirrored to the peer as ERROR.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Local write failure while handing the payload to its sink.
    #[error("resource error: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown transfer session {0}")]
    UnknownSession(SessionId),

    #[error("{kind} content of {size} bytes exceeds the {limit} byte ceiling")]
    TooLarge {
        kind: TransferKind,
        size: u64,
        limit: u64,
    },

    #[error("transfer cannot move from {from:?} to {to:?}")]
    InvalidStatus {
        from: TransferStatus,
        to: TransferStatus,
    },

    /// Content is only exchanged with paired devices.
    #[error("device {0} is not paired")]
    NotPaired(DeviceId),

    #[error("peer reported an error: {0}")]
    Remote(String),

    #[error("transfer cancelled")]
    Cancelled,
}
