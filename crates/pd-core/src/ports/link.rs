//! Direct peer transport negotiated through signaling.
//!
//! A link is created per session. It reports everything through its event
//! sink: outbound negotiation data to relay, the channel opening, inbound
//! messages and teardown. All methods take `&self`; long-running work
//! (accepting, connecting, reading) runs on tasks the link spawns itself.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ids::DeviceId;
use crate::network::{SessionRole, SignalKind};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Negotiation data to relay to the remote side.
    Signal {
        kind: SignalKind,
        data: serde_json::Value,
    },
    Open,
    Message(Bytes),
    /// Remote side closed the channel gracefully.
    Closed,
    Failed(String),
}

pub type LinkEventSink = mpsc::UnboundedSender<LinkEvent>;

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Starts negotiation. Initiators emit their offer from here; responders
    /// wait for `apply_remote_signal`.
    async fn start(&self) -> Result<()>;

    async fn apply_remote_signal(&self, kind: SignalKind, data: serde_json::Value) -> Result<()>;

    /// Writes one message. Waits while the transport's write buffer is full.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Tears the transport down. Idempotent; emits no event.
    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn open(
        &self,
        local: &DeviceId,
        remote: &DeviceId,
        role: SessionRole,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>>;
}
