use async_trait::async_trait;

#[async_trait]
pub trait ScreenLockProbe: Send + Sync {
    async fn is_locked(&self) -> anyhow::Result<bool>;
}
