use super::protocol::{ContentMeta, TransferKind};
use super::session::TransferDirection;
use crate::ids::{DeviceId, SessionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// An offer is waiting for a manual accept/reject decision.
    OfferReceived {
        session_id: SessionId,
        from: DeviceId,
        kind: TransferKind,
        meta: ContentMeta,
        sender_name: String,
    },
    Progress {
        session_id: SessionId,
        transferred_bytes: u64,
        total_bytes: u64,
    },
    Completed {
        session_id: SessionId,
        direction: TransferDirection,
        kind: TransferKind,
    },
    Failed {
        session_id: SessionId,
        error: String,
    },
    Rejected {
        session_id: SessionId,
        reason: String,
    },
}
