pub mod pairing;
pub mod transfer;

pub use pairing::{AuthCodeService, PairingConfig, PairingCoordinator, PairingPorts};
pub use transfer::{ChunkedTransferEngine, OfferOutcome, TransferConfig, TransferPorts};
