use crate::domain::devices::{Device, DeviceId};
use async_trait::async_trait;

#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn save(&self, device: Device) -> anyhow::Result<Device>;
    async fn get(&self, id: &DeviceId) -> anyhow::Result<Option<Device>>;
    async fn list(&self) -> anyhow::Result<Vec<Device>>;
    /// Returns whether a record was removed.
    async fn delete(&self, id: &DeviceId) -> anyhow::Result<bool>;
}
