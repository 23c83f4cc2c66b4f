use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceDescriptor, Platform};
use crate::ids::DeviceId;

/// A device trusted for transfers. Created on pair, deleted on unpair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDeviceRecord {
    pub device_id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
    pub paired_at: DateTime<Utc>,
}

impl PairedDeviceRecord {
    pub fn from_descriptor(descriptor: DeviceDescriptor, paired_at: DateTime<Utc>) -> Self {
        Self {
            device_id: descriptor.device_id,
            name: descriptor.name,
            platform: descriptor.platform,
            paired_at,
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.device_id.clone(), self.name.clone(), self.platform)
    }

    /// Whether `descriptor` carries a different name or platform than the
    /// stored record.
    pub fn differs_from(&self, descriptor: &DeviceDescriptor) -> bool {
        self.name != descriptor.name || self.platform != descriptor.platform
    }
}
