//! Chunked clipboard and file transfer between connected devices.

mod config;
mod engine;

pub use config::TransferConfig;
pub use engine::{ChunkedTransferEngine, OfferOutcome, TransferPorts, REJECT_NOT_PAIRED, REJECT_TOO_LARGE};
