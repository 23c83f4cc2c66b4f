//! Ports: the traits adapters implement and use cases depend on.

mod clock;
mod connection;
mod errors;
mod link;
mod paired_device_repository;
mod signaling;
mod transfer_sink;

pub use clock::ClockPort;
pub use connection::PeerConnectionPort;
pub use errors::PairedDeviceRepositoryError;
pub use link::{LinkEvent, LinkEventSink, PeerLink, PeerLinkFactory};
pub use paired_device_repository::PairedDeviceRepositoryPort;
pub use signaling::SignalingPort;
pub use transfer_sink::{ReceivedContent, TransferSinkPort};
