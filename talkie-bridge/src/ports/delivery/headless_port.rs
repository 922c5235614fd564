use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeadlessRequest {
    pub session_id: String,
    /// Working directory the agent resumes in.
    pub cwd: Option<PathBuf>,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadlessReply {
    pub text: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeadlessError {
    #[error("agent cli exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },
    #[error("agent cli could not run: {0}")]
    Command(String),
}

/// Resume a session without any UI and collect the assistant reply.
#[async_trait]
pub trait HeadlessInvoker: Send + Sync {
    async fn invoke(&self, request: &HeadlessRequest) -> Result<HeadlessReply, HeadlessError>;
}
