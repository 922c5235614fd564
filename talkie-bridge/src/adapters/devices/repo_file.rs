use crate::domain::devices::{Device, DeviceId};
use crate::ports::devices::DeviceRepository;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const TMP_SUFFIX: &str = ".tmp";

/// Paired devices persisted as a flat JSON array; absent file means no devices.
pub struct FileDeviceRegistry {
    path: PathBuf,
    inner: RwLock<HashMap<DeviceId, Device>>,
}

impl FileDeviceRegistry {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        let devices = if path.exists() {
            let data = std::fs::read(&path)
                .with_context(|| format!("reading device registry {}", path.display()))?;
            if data.iter().all(u8::is_ascii_whitespace) {
                HashMap::new()
            } else {
                let devices: Vec<Device> = serde_json::from_slice(&data)
                    .with_context(|| format!("parsing device registry {}", path.display()))?;
                devices
                    .into_iter()
                    .map(|device| (device.id().clone(), device))
                    .collect()
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            inner: RwLock::new(devices),
        })
    }

    /// Serializes under the caller's lock so concurrent writers cannot reorder files.
    async fn persist(&self, devices: &HashMap<DeviceId, Device>) -> anyhow::Result<()> {
        let mut snapshot: Vec<&Device> = devices.values().collect();
        snapshot.sort_by(|a, b| a.id().cmp(b.id()));
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp_path = self.path.with_extension(format!("json{TMP_SUFFIX}"));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("creating temp device registry {}", tmp_path.display()))?;
        file.write_all(&json)
            .await
            .with_context(|| format!("writing temp device registry {}", tmp_path.display()))?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming device registry to {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl DeviceRepository for FileDeviceRegistry {
    async fn save(&self, device: Device) -> anyhow::Result<Device> {
        let mut devices = self.inner.write().await;
        devices.insert(device.id().clone(), device.clone());
        self.persist(&devices).await?;
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
        let mut devices = self.inner.write().await;
        if devices.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&devices).await?;
        Ok(true)
    }
}
