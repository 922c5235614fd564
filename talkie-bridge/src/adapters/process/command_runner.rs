use crate::ports::process::{CommandError, CommandOutput, CommandRequest, CommandRunner};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Spawns programs directly (no shell) and kills them when the timeout fires.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, request: &CommandRequest) -> Result<CommandOutput, CommandError> {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        if !request.env.is_empty() {
            command.envs(&request.env);
        }

        debug!(program = %request.program, args = ?request.args, "spawning command");
        let child = command.spawn().map_err(|err| CommandError::Spawn {
            program: request.program.clone(),
            reason: err.to_string(),
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = tokio::time::timeout(request.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::TimedOut {
                program: request.program.clone(),
                timeout: request.timeout,
            })?
            .map_err(|err| CommandError::Spawn {
                program: request.program.clone(),
                reason: err.to_string(),
            })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}
