use async_trait::async_trait;

use super::errors::PairedDeviceRepositoryError;
use crate::ids::DeviceId;
use crate::pairing::PairedDeviceRecord;

#[async_trait]
pub trait PairedDeviceRepositoryPort: Send + Sync {
    async fn get(&self, device_id: &DeviceId) -> Result<Option<PairedDeviceRecord>, PairedDeviceRepositoryError>;

    async fn list_all(&self) -> Result<Vec<PairedDeviceRecord>, PairedDeviceRepositoryError>;

    async fn upsert(&self, record: PairedDeviceRecord) -> Result<(), PairedDeviceRepositoryError>;

    /// Deleting an unknown device is not an error.
    async fn delete(&self, device_id: &DeviceId) -> Result<(), PairedDeviceRepositoryError>;
}
