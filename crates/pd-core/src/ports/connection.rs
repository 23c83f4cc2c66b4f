use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::ids::DeviceId;
use crate::network::{ConnectionError, ConnectionState, PeerEvent, SignalEnvelope, SignalKind};

/// Per-device peer channels as seen by the transfer and pairing use cases.
#[async_trait]
pub trait PeerConnectionPort: Send + Sync {
    async fn create_offer(&self, device_id: &DeviceId) -> Result<(), ConnectionError>;

    async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<(), ConnectionError>;

    /// Sends now if connected, otherwise queues until the session connects.
    async fn send(&self, device_id: &DeviceId, message: Bytes) -> Result<(), ConnectionError>;

    /// Sends to every connected session; returns how many were reached.
    async fn broadcast(&self, message: Bytes) -> Result<usize, ConnectionError>;

    async fn close(&self, device_id: &DeviceId) -> Result<(), ConnectionError>;

    /// Relays a non-negotiation envelope (e.g. `pair`) through signaling.
    async fn signal(
        &self,
        device_id: &DeviceId,
        kind: SignalKind,
        data: serde_json::Value,
    ) -> Result<(), ConnectionError>;

    async fn buffered_amount(&self, device_id: &DeviceId) -> Result<usize, ConnectionError>;

    /// Resolves once the buffered amount is at or below `low_water`.
    async fn wait_for_drain(&self, device_id: &DeviceId, low_water: usize) -> Result<(), ConnectionError>;

    async fn session_state(&self, device_id: &DeviceId) -> Result<Option<ConnectionState>, ConnectionError>;

    async fn connected_devices(&self) -> Result<Vec<DeviceId>, ConnectionError>;

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, ConnectionError>;
}
