//! # pd-network
//!
//! Peer channel plumbing: the [`PeerConnectionManager`] actor, the signaling
//! adapters it relays negotiation through, and the peer-link adapters that
//! carry the data.

pub mod connection;
pub mod link;
pub mod signaling;

pub use connection::PeerConnectionManager;
pub use link::{MemoryLinkFactory, TcpLinkFactory};
pub use signaling::{MemorySignaling, MemorySignalingHub, WebSocketSignaling};
