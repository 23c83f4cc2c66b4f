//! Connection-layer types: signaling envelopes, peer sessions and events.

pub mod envelope;
pub mod error;
pub mod events;
pub mod session;

pub use envelope::{SignalEnvelope, SignalKind};
pub use error::ConnectionError;
pub use events::PeerEvent;
pub use session::{ConnectionState, InvalidTransition, PeerSession, SessionRole};
