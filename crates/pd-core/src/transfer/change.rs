//! Change detection for outbound offers.
//!
//! Writing received clipboard content locally fires the local clipboard
//! watcher, which would offer the same bytes straight back. Remembering a
//! fingerprint of the last content exchanged with each peer per kind breaks
//! that loop without stopping the same content from reaching other peers.

use std::collections::HashMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

use super::protocol::TransferKind;
use crate::ids::DeviceId;

/// Non-cryptographic 64-bit fingerprint of a payload.
pub fn fingerprint(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

#[derive(Debug, Default, Clone)]
pub struct ChangeDetector {
    last_seen: HashMap<(TransferKind, DeviceId), u64>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_unchanged(&self, kind: TransferKind, peer: &DeviceId, data: &[u8]) -> bool {
        self.last_seen.get(&(kind, peer.clone())) == Some(&fingerprint(data))
    }

    /// Records `data` as the last content exchanged with `peer`.
    pub fn remember(&mut self, kind: TransferKind, peer: &DeviceId, data: &[u8]) {
        self.last_seen.insert((kind, peer.clone()), fingerprint(data));
    }

    /// Drops the entry for `peer` if it still holds `data`, so a rejected or
    /// failed offer can be made again.
    pub fn forget(&mut self, kind: TransferKind, peer: &DeviceId, data: &[u8]) {
        let key = (kind, peer.clone());
        if self.last_seen.get(&key) == Some(&fingerprint(data)) {
            self.last_seen.remove(&key);
        }
    }
}
