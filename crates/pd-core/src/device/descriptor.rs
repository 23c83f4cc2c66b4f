use serde::{Deserialize, Serialize};

use super::Platform;
use crate::ids::DeviceId;

/// Identity of a remote device as known from discovery, a bootstrap input or
/// a `pair` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    pub name: String,
    #[serde(default)]
    pub platform: Platform,
}

impl DeviceDescriptor {
    pub fn new(device_id: impl Into<DeviceId>, name: impl Into<String>, platform: Platform) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            platform,
        }
    }

    /// Descriptor with only an id known; the id doubles as display name.
    pub fn anonymous(device_id: impl Into<DeviceId>) -> Self {
        let device_id = device_id.into();
        let name = device_id.to_string();
        Self {
            device_id,
            name,
            platform: Platform::Unknown,
        }
    }
}

/// The local device, passed explicitly into every component that needs to
/// know who "we" are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContext {
    pub device_id: DeviceId,
    pub device_name: String,
    pub platform: Platform,
}

impl DeviceContext {
    pub fn new(device_id: impl Into<DeviceId>, device_name: impl Into<String>, platform: Platform) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            platform,
        }
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.device_id.clone(), self.device_name.clone(), self.platform)
    }
}
