use crate::domain::sessions::Session;
use async_trait::async_trait;

/// Uncached discovery of sessions from their transcripts.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Full scan, newest activity first.
    async fn scan(&self) -> anyhow::Result<Vec<Session>>;
    /// Direct lookup by session id or project folder name.
    async fn find(&self, id: &str) -> anyhow::Result<Option<Session>>;
}

#[async_trait]
pub trait AgentProcessProbe: Send + Sync {
    async fn agent_running(&self) -> bool;
}
