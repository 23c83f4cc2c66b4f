use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::DeviceDescriptor;

/// A device currently visible through the discovery event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    pub descriptor: DeviceDescriptor,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_paired: bool,
}

impl DiscoveredDevice {
    pub fn new(descriptor: DeviceDescriptor, now: DateTime<Utc>, is_paired: bool) -> Self {
        Self {
            descriptor,
            discovered_at: now,
            last_seen: now,
            is_paired,
        }
    }
}
