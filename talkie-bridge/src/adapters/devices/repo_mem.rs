use crate::domain::devices::{Device, DeviceId};
use crate::ports::devices::DeviceRepository;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryDeviceRepository {
    inner: RwLock<HashMap<DeviceId, Device>>,
}

impl InMemoryDeviceRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn save(&self, device: Device) -> anyhow::Result<Device> {
        self.inner
            .write()
            .await
            .insert(device.id().clone(), device.clone());
        Ok(device)
    }

    async fn get(&self, id: &DeviceId) -> anyhow::Result<Option<Device>> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.inner.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.requested_at().cmp(&b.requested_at()));
        Ok(devices)
    }

    async fn delete(&self, id: &DeviceId) -> anyhow::Result<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }
}
