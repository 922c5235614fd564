use crate::ports::process::{CommandRequest, CommandRunner};
use crate::ports::sessions::AgentProcessProbe;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const PGREP_TIMEOUT: Duration = Duration::from_secs(2);

/// Checks for a running agent process by exact name via `pgrep -x`.
pub struct PgrepAgentProbe {
    runner: Arc<dyn CommandRunner>,
    process_name: String,
}

impl PgrepAgentProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, process_name: impl Into<String>) -> Self {
        Self {
            runner,
            process_name: process_name.into(),
        }
    }
}

#[async_trait]
impl AgentProcessProbe for PgrepAgentProbe {
    async fn agent_running(&self) -> bool {
        let request = CommandRequest::new("pgrep", PGREP_TIMEOUT)
            .args(["-x", self.process_name.as_str()]);
        match self.runner.run(&request).await {
            Ok(output) => output.success(),
            Err(err) => {
                debug!(%err, "pgrep unavailable; treating agent as not running");
                false
            }
        }
    }
}

/// Fixed answer, for hosts without process inspection and for tests.
#[derive(Clone, Copy, Debug)]
pub struct StaticAgentProbe(pub bool);

#[async_trait]
impl AgentProcessProbe for StaticAgentProbe {
    async fn agent_running(&self) -> bool {
        self.0
    }
}
