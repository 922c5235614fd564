use crate::domain::delivery::VerificationResult;
use serde_json::Value;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{self, Duration, Instant};
use tracing::debug;

const DEFAULT_WINDOW: Duration = Duration::from_secs(3);
const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_TAIL_MESSAGES: usize = 10;
const DEFAULT_PREFIX_CHARS: usize = 100;
/// Only the end of the transcript is read on each poll.
const TAIL_BYTES: u64 = 256 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyConfig {
    pub window: Duration,
    pub interval: Duration,
    pub tail_messages: usize,
    pub prefix_chars: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            interval: DEFAULT_INTERVAL,
            tail_messages: DEFAULT_TAIL_MESSAGES,
            prefix_chars: DEFAULT_PREFIX_CHARS,
        }
    }
}

/// Watches a session transcript for a message we just pasted.
///
/// A miss is not a failure: the agent may still be busy writing the line.
#[derive(Clone, Debug, Default)]
pub struct TranscriptVerifier {
    config: VerifyConfig,
}

impl TranscriptVerifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    pub async fn verify(&self, transcript: &Path, text: &str) -> VerificationResult {
        let needle = needle(text, self.config.prefix_chars);
        if needle.is_empty() {
            return VerificationResult {
                verified: false,
                attempts: 0,
            };
        }

        let deadline = Instant::now() + self.config.window;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match recent_user_messages(transcript, self.config.tail_messages).await {
                Ok(messages) => {
                    if messages
                        .iter()
                        .any(|message| message.to_lowercase().contains(&needle))
                    {
                        return VerificationResult {
                            verified: true,
                            attempts,
                        };
                    }
                }
                Err(err) => {
                    debug!(path = %transcript.display(), error = %err, "transcript not readable yet");
                }
            }
            if Instant::now() + self.config.interval > deadline {
                break;
            }
            time::sleep(self.config.interval).await;
        }
        VerificationResult {
            verified: false,
            attempts,
        }
    }
}

fn needle(text: &str, prefix_chars: usize) -> String {
    text.trim()
        .chars()
        .take(prefix_chars)
        .collect::<String>()
        .to_lowercase()
}

/// Text of the last `limit` user entries, oldest first.
pub async fn recent_user_messages(path: &Path, limit: usize) -> std::io::Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let start = len.saturating_sub(TAIL_BYTES);
    if start > 0 {
        file.seek(SeekFrom::Start(start)).await?;
    }
    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut bytes).await?;
    let body = String::from_utf8_lossy(&bytes);

    let mut lines = body.lines();
    if start > 0 {
        // first line is probably cut in half
        lines.next();
    }
    let mut messages: Vec<String> = lines.filter_map(user_text).collect();
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
    Ok(messages)
}

fn user_text(line: &str) -> Option<String> {
    let record: Value = serde_json::from_str(line.trim()).ok()?;
    if record.get("type").and_then(Value::as_str) != Some("user") {
        return None;
    }
    let content = record.get("message")?.get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let text = blocks
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n");
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}
