use crate::domain::matching::TerminalFingerprint;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// User-confirmed terminal to session bindings.
#[async_trait]
pub trait ConfirmedMappingRepository: Send + Sync {
    async fn all(&self) -> anyhow::Result<BTreeMap<TerminalFingerprint, String>>;
    async fn confirm(&self, fingerprint: TerminalFingerprint, session_id: String)
        -> anyhow::Result<()>;
}
