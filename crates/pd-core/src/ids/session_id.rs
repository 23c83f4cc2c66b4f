use serde::{Deserialize, Serialize};

use super::id_macro::impl_id;

/// Identifier of one chunked transfer (shared by sender and receiver).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Identifier of one peer connection attempt.
///
/// Every offer, local or remote, mints a fresh value so events coming from a
/// torn-down link can be told apart from the live one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl_id!(SessionId, ConnectionId);
