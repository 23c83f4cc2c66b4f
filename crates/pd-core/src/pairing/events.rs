use crate::device::{DeviceDescriptor, Platform};
use crate::ids::DeviceId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    DeviceFound(DeviceDescriptor),
    DeviceLost(DeviceId),
    PairingRequestReceived {
        device_id: DeviceId,
        name: String,
        platform: Platform,
    },
    Paired(DeviceDescriptor),
    Unpaired(DeviceId),
    RequestRejected(DeviceId),
}
