use thiserror::Error;

use super::session::ConnectionState;
use crate::ids::DeviceId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("a live session already exists for device {0}")]
    DuplicateSession(DeviceId),

    #[error("no session for device {0}")]
    NoSession(DeviceId),

    #[error("session for device {device_id} is {state}")]
    NotLive {
        device_id: DeviceId,
        state: ConnectionState,
    },

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("connection manager is not initialized")]
    NotInitialized,

    #[error("connection manager has stopped")]
    ManagerStopped,
}
