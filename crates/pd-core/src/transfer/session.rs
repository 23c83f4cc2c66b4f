use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::TransferError;
use super::protocol::{ContentMeta, TransferKind};
use crate::ids::{DeviceId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
    Rejected,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Rejected
        )
    }

    fn can_become(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, Syncing) | (Pending, Rejected) | (Pending, Failed) | (Syncing, Completed) | (Syncing, Failed)
        )
    }
}

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub transferred_bytes: u64,
    /// True when the chunk id had been stored before and was overwritten.
    pub replaced: bool,
}

/// One chunked transfer, as seen by either side.
///
/// The receiver buffers chunks keyed by chunk id, so arrival order does not
/// matter and a re-delivered chunk replaces the earlier copy.
/// `transferred_bytes` is always the sum of the distinct buffered chunk
/// lengths (receive side) or of the chunks handed to the transport (send
/// side), and never exceeds `total_bytes`.
#[derive(Debug, Clone)]
pub struct TransferSession {
    id: SessionId,
    peer: DeviceId,
    direction: TransferDirection,
    kind: TransferKind,
    meta: ContentMeta,
    status: TransferStatus,
    total_bytes: u64,
    transferred_bytes: u64,
    chunks: BTreeMap<u64, Bytes>,
    held: Option<Bytes>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn outgoing(id: SessionId, peer: DeviceId, kind: TransferKind, meta: ContentMeta, payload: Bytes) -> Self {
        let mut session = Self::new(id, peer, TransferDirection::Send, kind, meta);
        session.held = Some(payload);
        session
    }

    pub fn incoming(id: SessionId, peer: DeviceId, kind: TransferKind, meta: ContentMeta) -> Self {
        Self::new(id, peer, TransferDirection::Receive, kind, meta)
    }

    fn new(id: SessionId, peer: DeviceId, direction: TransferDirection, kind: TransferKind, meta: ContentMeta) -> Self {
        Self {
            id,
            peer,
            direction,
            kind,
            total_bytes: meta.size,
            meta,
            status: TransferStatus::Pending,
            transferred_bytes: 0,
            chunks: BTreeMap::new(),
            held: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn peer(&self) -> &DeviceId {
        &self.peer
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn meta(&self) -> &ContentMeta {
        &self.meta
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn received_chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn set_status(&mut self, next: TransferStatus) -> Result<(), TransferError> {
        if !self.status.can_become(next) {
            return Err(TransferError::InvalidStatus {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Marks the transfer failed and drops the reassembly buffer. The held
    /// payload is kept so a caller can inspect or retry it until `release`.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
        self.chunks.clear();
    }

    /// Stores a received chunk.
    pub fn record_chunk(&mut self, chunk_id: u64, data: Bytes) -> Result<ChunkReceipt, TransferError> {
        if self.status != TransferStatus::Syncing {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {} arrived while transfer {} is {:?}",
                chunk_id, self.id, self.status
            )));
        }

        let previous_len = self.chunks.get(&chunk_id).map(|c| c.len() as u64);
        let next_total = self.transferred_bytes - previous_len.unwrap_or(0) + data.len() as u64;
        if next_total > self.total_bytes {
            return Err(TransferError::ProtocolViolation(format!(
                "chunk {} pushes transfer {} to {} bytes, above the offered {}",
                chunk_id, self.id, next_total, self.total_bytes
            )));
        }

        self.chunks.insert(chunk_id, data);
        self.transferred_bytes = next_total;
        Ok(ChunkReceipt {
            transferred_bytes: next_total,
            replaced: previous_len.is_some(),
        })
    }

    /// Sender-side progress after a chunk was handed to the transport.
    pub fn record_sent(&mut self, len: usize) -> u64 {
        self.transferred_bytes = (self.transferred_bytes + len as u64).min(self.total_bytes);
        self.transferred_bytes
    }

    /// Concatenates the buffered chunks in chunk-id order.
    ///
    /// Fails when ids are not contiguous from 0 or the size differs from the
    /// offered size.
    pub fn assemble(&self) -> Result<Bytes, TransferError> {
        let mut assembled = BytesMut::with_capacity(self.total_bytes as usize);
        for (expected, (chunk_id, chunk)) in self.chunks.iter().enumerate() {
            if *chunk_id != expected as u64 {
                return Err(TransferError::ProtocolViolation(format!(
                    "transfer {} is missing chunk {}",
                    self.id, expected
                )));
            }
            assembled.extend_from_slice(chunk);
        }

        if assembled.len() as u64 != self.total_bytes {
            return Err(TransferError::ProtocolViolation(format!(
                "transfer {} assembled {} bytes, offered {}",
                self.id,
                assembled.len(),
                self.total_bytes
            )));
        }
        Ok(assembled.freeze())
    }

    pub fn hold(&mut self, payload: Bytes) {
        self.held = Some(payload);
    }

    pub fn held(&self) -> Option<&Bytes> {
        self.held.as_ref()
    }

    /// Drops every buffered byte (held payload and reassembly buffer).
    pub fn release(&mut self) -> Option<Bytes> {
        self.chunks.clear();
        self.held.take()
    }
}
