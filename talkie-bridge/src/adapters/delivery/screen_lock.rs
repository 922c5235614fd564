use crate::ports::delivery::ScreenLockProbe;
use crate::ports::process::{CommandRequest, CommandRunner};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

const IOREG_TIMEOUT: Duration = Duration::from_secs(2);
const LOCKED_MARKER: &str = "\"CGSSessionScreenIsLocked\"=Yes";

/// Reads the console session dictionary from the IORegistry (macOS).
pub struct IoregScreenLockProbe {
    runner: Arc<dyn CommandRunner>,
}

impl IoregScreenLockProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ScreenLockProbe for IoregScreenLockProbe {
    async fn is_locked(&self) -> anyhow::Result<bool> {
        let request = CommandRequest::new("ioreg", IOREG_TIMEOUT)
            .args(["-n", "Root", "-d1"])
            .env("LC_ALL", "C");
        let output = self
            .runner
            .run(&request)
            .await
            .context("querying screen lock state")?;
        if !output.success() {
            bail!("ioreg exited with {:?}", output.exit_code);
        }
        Ok(output.stdout.contains(LOCKED_MARKER))
    }
}

/// For hosts without a lock screen concept.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverLocked;

#[async_trait]
impl ScreenLockProbe for NeverLocked {
    async fn is_locked(&self) -> anyhow::Result<bool> {
        Ok(false)
    }
}
