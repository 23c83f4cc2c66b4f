//! Peer session state machine.
//!
//! ```text
//! new ──► connecting ──► connected
//!  │          │              │
//!  └──────────┴──► failed ◄──┘
//!                    │
//!   (any) ─────────► closed
//! ```
//!
//! `failed` and `closed` are terminal: a session in either state is never
//! revived, a new attempt always builds a fresh `PeerSession`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

use crate::ids::{ConnectionId, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// Sent the offer.
    Initiator,
    /// Answered a remote offer.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Live sessions block a new offer toward the same device.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    fn can_become(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (New, Connecting) | (New, Failed) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Failed) => true,
            (Closed, _) => false,
            (_, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// One connection attempt toward a remote device.
#[derive(Debug)]
pub struct PeerSession {
    device_id: DeviceId,
    connection_id: ConnectionId,
    role: SessionRole,
    state: ConnectionState,
    created_at: DateTime<Utc>,
    pending_outbox: VecDeque<Bytes>,
}

impl PeerSession {
    pub fn new(device_id: DeviceId, role: SessionRole) -> Self {
        Self {
            device_id,
            connection_id: ConnectionId::new(),
            role,
            state: ConnectionState::New,
            created_at: Utc::now(),
            pending_outbox: VecDeque::new(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Moves to `next`. Leaving the live states drops anything still queued:
    /// undelivered messages are never carried over to another session.
    pub fn transition(&mut self, next: ConnectionState) -> Result<ConnectionState, InvalidTransition> {
        if !self.state.can_become(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        if next.is_terminal() {
            self.pending_outbox.clear();
        }
        Ok(previous)
    }

    pub fn enqueue(&mut self, message: Bytes) {
        self.pending_outbox.push_back(message);
    }

    /// Takes the queued messages in FIFO order, typically right after the
    /// session reaches `connected`.
    pub fn drain_outbox(&mut self) -> VecDeque<Bytes> {
        std::mem::take(&mut self.pending_outbox)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_outbox.len()
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_outbox.iter().map(Bytes::len).sum()
    }
}
