use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ids::DeviceId;
use crate::network::SignalEnvelope;

/// Rendezvous channel used only to relay negotiation and pairing envelopes.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Joins the room keyed by the local device id. Envelopes addressed to
    /// that room arrive on the returned receiver until `leave`.
    async fn join(&self, room: &DeviceId) -> Result<mpsc::Receiver<SignalEnvelope>>;

    /// Relays an envelope to the room named by `envelope.to`.
    async fn send(&self, envelope: SignalEnvelope) -> Result<()>;

    async fn heartbeat(&self) -> Result<()>;

    async fn leave(&self) -> Result<()>;
}
