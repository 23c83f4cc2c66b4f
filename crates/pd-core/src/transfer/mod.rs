//! Chunked transfer protocol: messages, per-transfer state and helpers.

pub mod change;
pub mod chunker;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;

pub use change::{fingerprint, ChangeDetector};
pub use chunker::{chunk_count, Chunker};
pub use error::TransferError;
pub use events::TransferEvent;
pub use protocol::{
    ChunkPayload, ContentMeta, ErrorPayload, OfferPayload, RejectPayload, TransferKind,
    TransferMessage, CHUNK_SIZE,
};
pub use session::{ChunkReceipt, TransferDirection, TransferSession, TransferStatus};
