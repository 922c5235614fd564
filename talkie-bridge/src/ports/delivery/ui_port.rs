use crate::domain::delivery::AudioClip;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// What the UI collaborator needs to type into the right terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardRequest {
    pub session_id: String,
    pub project_path: String,
    pub text: String,
    pub audio: Option<AudioClip>,
    /// Press enter after pasting.
    pub submit: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UiForwardError {
    #[error("ui automation unreachable: {0}")]
    Connect(String),
    #[error("ui automation did not answer within {0:?}")]
    TimedOut(Duration),
    #[error("ui automation rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("ui automation request failed: {0}")]
    Other(String),
}

impl UiForwardError {
    /// Only connection-level failures are safe to retry; a timed out paste may
    /// already have landed.
    pub fn is_transient(&self) -> bool {
        matches!(self, UiForwardError::Connect(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UiForwardError::Connect(_) => "connect",
            UiForwardError::TimedOut(_) => "timeout",
            UiForwardError::Rejected { .. } => "rejected",
            UiForwardError::Other(_) => "other",
        }
    }
}

#[async_trait]
pub trait UiAutomationPort: Send + Sync {
    async fn healthy(&self, timeout: Duration) -> bool;
    async fn forward(&self, request: &ForwardRequest, timeout: Duration)
        -> Result<(), UiForwardError>;
}
