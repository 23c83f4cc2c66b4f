use bytes::Bytes;

use super::envelope::SignalEnvelope;
use super::session::ConnectionState;
use crate::ids::{ConnectionId, DeviceId};

/// Events published by the connection manager to its subscribers.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A session changed state. Emitted once per transition.
    StateChanged {
        device_id: DeviceId,
        connection_id: ConnectionId,
        state: ConnectionState,
    },
    /// A message arrived over an established peer channel.
    DataReceived { device_id: DeviceId, data: Bytes },
    /// A `pair` envelope arrived through signaling; it is not negotiation.
    PairSignal(SignalEnvelope),
}
