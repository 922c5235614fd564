use crate::domain::matching::TerminalDescriptor;
use async_trait::async_trait;

#[async_trait]
pub trait TerminalSource: Send + Sync {
    /// Currently open terminal windows; empty when the source is unreachable.
    async fn list_terminals(&self) -> Vec<TerminalDescriptor>;
}
