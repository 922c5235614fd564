use crate::domain::matching::TerminalDescriptor;
use crate::ports::delivery::{ForwardRequest, UiAutomationPort, UiForwardError};
use crate::ports::matching::TerminalSource;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

const TERMINALS_TIMEOUT: Duration = Duration::from_secs(3);

/// Local HTTP client for the paste-into-terminal collaborator.
#[derive(Clone)]
pub struct HttpUiAutomationClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PasteBody<'a> {
    session_id: &'a str,
    project_path: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    submit: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TerminalsBody {
    Wrapped { terminals: Vec<TerminalDescriptor> },
    Bare(Vec<TerminalDescriptor>),
}

impl HttpUiAutomationClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> UiForwardError {
    if err.is_timeout() {
        return UiForwardError::TimedOut(timeout);
    }
    if err.is_connect() || is_connection_level(&err) {
        return UiForwardError::Connect(err.to_string());
    }
    UiForwardError::Other(err.to_string())
}

fn is_connection_level(err: &(dyn StdError + 'static)) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = current.source();
    }
    false
}

#[async_trait]
impl UiAutomationPort for HttpUiAutomationClient {
    async fn healthy(&self, timeout: Duration) -> bool {
        match self
            .client
            .get(self.url("/health"))
            .timeout(timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(%err, "ui automation health probe failed");
                false
            }
        }
    }

    async fn forward(
        &self,
        request: &ForwardRequest,
        timeout: Duration,
    ) -> Result<(), UiForwardError> {
        let body = PasteBody {
            session_id: &request.session_id,
            project_path: &request.project_path,
            text: &request.text,
            audio: request.audio.as_ref().map(|clip| clip.data.as_str()),
            format: request.audio.as_ref().map(|clip| clip.format.as_str()),
            submit: request.submit,
        };
        let resp = self
            .client
            .post(self.url("/paste"))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|err| classify(err, timeout))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let message = resp.text().await.unwrap_or_default();
        Err(UiForwardError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl TerminalSource for HttpUiAutomationClient {
    async fn list_terminals(&self) -> Vec<TerminalDescriptor> {
        let resp = match self
            .client
            .get(self.url("/terminals"))
            .timeout(TERMINALS_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = %resp.status(), "ui automation refused terminal listing");
                return Vec::new();
            }
            Err(err) => {
                debug!(%err, "ui automation unreachable; no terminals to match");
                return Vec::new();
            }
        };
        match resp.json::<TerminalsBody>().await {
            Ok(TerminalsBody::Wrapped { terminals }) | Ok(TerminalsBody::Bare(terminals)) => {
                terminals
            }
            Err(err) => {
                warn!(%err, "ui automation returned an unreadable terminal list");
                Vec::new()
            }
        }
    }
}
