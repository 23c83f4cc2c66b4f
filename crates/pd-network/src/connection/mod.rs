mod manager;
mod outbox;

pub use manager::PeerConnectionManager;
pub use outbox::BufferGauge;
