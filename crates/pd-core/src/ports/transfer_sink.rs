use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::ids::{DeviceId, SessionId};
use crate::transfer::{ContentMeta, TransferKind};

/// A fully reassembled payload ready for its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedContent {
    pub session_id: SessionId,
    pub from: DeviceId,
    pub kind: TransferKind,
    pub meta: ContentMeta,
    pub data: Bytes,
}

/// Destination for received content of one kind: the system clipboard for
/// clipboard transfers, the download directory for files.
#[async_trait]
pub trait TransferSinkPort: Send + Sync {
    async fn deliver(&self, content: ReceivedContent) -> Result<()>;
}
