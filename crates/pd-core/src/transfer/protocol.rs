//! Transfer protocol messages exchanged over an established peer channel.
//!
//! Wire form (JSON): `{"type": "OFFER" | "ACCEPT" | "REJECT" | "CHUNK" |
//! "COMPLETE" | "ERROR", "sessionId": "...", "payload": {...}}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::SessionId;

/// Maximum payload bytes carried by one CHUNK message.
pub const CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Clipboard,
    File,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Clipboard => f.write_str("clipboard"),
            TransferKind::File => f.write_str("file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentMeta {
    pub size: u64,
    pub mime_type: String,
    /// Short text preview shown in the approval prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub kind: TransferKind,
    pub content_meta: ContentMeta,
    pub sender_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkPayload {
    pub chunk_id: u64,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPayload {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferMessage {
    #[serde(rename_all = "camelCase")]
    Offer {
        session_id: SessionId,
        payload: OfferPayload,
    },
    #[serde(rename_all = "camelCase")]
    Accept { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Reject {
        session_id: SessionId,
        payload: RejectPayload,
    },
    #[serde(rename_all = "camelCase")]
    Chunk {
        session_id: SessionId,
        payload: ChunkPayload,
    },
    #[serde(rename_all = "camelCase")]
    Complete { session_id: SessionId },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: SessionId,
        payload: ErrorPayload,
    },
}

impl TransferMessage {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Offer { session_id, .. }
            | Self::Accept { session_id }
            | Self::Reject { session_id, .. }
            | Self::Chunk { session_id, .. }
            | Self::Complete { session_id }
            | Self::Error { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "OFFER",
            Self::Accept { .. } => "ACCEPT",
            Self::Reject { .. } => "REJECT",
            Self::Chunk { .. } => "CHUNK",
            Self::Complete { .. } => "COMPLETE",
            Self::Error { .. } => "ERROR",
        }
    }

    pub fn reject(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self::Reject {
            session_id,
            payload: RejectPayload {
                reason: reason.into(),
            },
        }
    }

    pub fn error(session_id: SessionId, error: impl Into<String>) -> Self {
        Self::Error {
            session_id,
            payload: ErrorPayload {
                error: error.into(),
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
