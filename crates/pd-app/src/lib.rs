//! PeerDrop application layer.
//!
//! Use cases over the core ports: the chunked transfer engine, the pairing
//! coordinator and the pairing code service, plus the [`App`] that owns them.

pub mod builder;
pub mod deps;
pub mod usecases;

#[cfg(test)]
mod test_support;

pub use builder::{App, AppBuilder};
pub use deps::AppDeps;
pub use usecases::{
    AuthCodeService, ChunkedTransferEngine, OfferOutcome, PairingConfig, PairingCoordinator, TransferConfig,
};
