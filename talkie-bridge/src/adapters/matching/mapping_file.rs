use crate::domain::matching::TerminalFingerprint;
use crate::ports::matching::ConfirmedMappingRepository;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::warn;

/// `{ "bundleId|windowTitle": "sessionId" }` on disk.
pub struct FileMappingRepository {
    path: PathBuf,
    inner: RwLock<BTreeMap<TerminalFingerprint, String>>,
}

impl FileMappingRepository {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        let mappings = if path.exists() {
            let data = std::fs::read(&path)
                .with_context(|| format!("reading terminal mappings {}", path.display()))?;
            if data.iter().all(u8::is_ascii_whitespace) {
                BTreeMap::new()
            } else {
                let raw: BTreeMap<String, String> = serde_json::from_slice(&data)
                    .with_context(|| format!("parsing terminal mappings {}", path.display()))?;
                raw.into_iter()
                    .filter_map(|(key, session)| match TerminalFingerprint::parse(&key) {
                        Ok(fingerprint) => Some((fingerprint, session)),
                        Err(err) => {
                            warn!(%key, %err, "dropping malformed terminal mapping");
                            None
                        }
                    })
                    .collect()
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            inner: RwLock::new(mappings),
        })
    }

    async fn persist(&self, mappings: &BTreeMap<TerminalFingerprint, String>) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(mappings)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)
            .await
            .with_context(|| format!("writing temp terminal mappings {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming terminal mappings to {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ConfirmedMappingRepository for FileMappingRepository {
    async fn all(&self) -> anyhow::Result<BTreeMap<TerminalFingerprint, String>> {
        Ok(self.inner.read().await.clone())
    }

    async fn confirm(
        &self,
        fingerprint: TerminalFingerprint,
        session_id: String,
    ) -> anyhow::Result<()> {
        let mut mappings = self.inner.write().await;
        mappings.insert(fingerprint, session_id);
        self.persist(&mappings).await
    }
}
