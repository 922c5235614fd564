use crate::ports::delivery::{HeadlessError, HeadlessInvoker, HeadlessReply, HeadlessRequest};
use crate::ports::process::{CommandRequest, CommandRunner};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_HEADLESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Resumes a session with the agent CLI in print mode and collects its reply.
pub struct ClaudeCliInvoker {
    runner: Arc<dyn CommandRunner>,
    program: String,
    timeout: Duration,
}

impl ClaudeCliInvoker {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout: DEFAULT_HEADLESS_TIMEOUT,
        }
    }

    fn command(&self, request: &HeadlessRequest) -> CommandRequest {
        let mut command = CommandRequest::new(&self.program, self.timeout).args([
            "--resume",
            request.session_id.as_str(),
            "--output-format",
            "stream-json",
            "--verbose",
            "-p",
            "--",
            request.text.as_str(),
        ]);
        if let Some(cwd) = &request.cwd {
            command = command.cwd(cwd);
        }
        command
    }
}

#[derive(Deserialize)]
struct StreamRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Joins every assistant text block; the final `result` record is the fallback.
pub fn collect_assistant_text(stdout: &str) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut result: Option<String> = None;
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<StreamRecord>(line) else {
            debug!("skipping non-json line from agent cli");
            continue;
        };
        match record.kind.as_str() {
            "assistant" => {
                let Some(message) = record.message else { continue };
                blocks.extend(
                    message
                        .content
                        .into_iter()
                        .filter(|block| block.kind == "text")
                        .filter_map(|block| block.text)
                        .filter(|text| !text.is_empty()),
                );
            }
            "result" => result = record.result,
            _ => {}
        }
    }
    if blocks.is_empty() {
        result.unwrap_or_default()
    } else {
        blocks.join("\n")
    }
}

#[async_trait]
impl HeadlessInvoker for ClaudeCliInvoker {
    async fn invoke(&self, request: &HeadlessRequest) -> Result<HeadlessReply, HeadlessError> {
        let command = self.command(request);
        info!(session = %request.session_id, "resuming session headlessly");
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|err| HeadlessError::Command(err.to_string()))?;
        if !output.success() {
            return Err(HeadlessError::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(HeadlessReply {
            text: collect_assistant_text(&output.stdout),
        })
    }
}
