use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Ui,
    Headless,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Ui => "ui",
            DeliveryMode::Headless => "headless",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why the router picked its mode; reported back so the caller can prompt the user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeReason {
    Locked,
    UiUnavailable,
    Unlocked,
}

impl ModeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeReason::Locked => "locked",
            ModeReason::UiUnavailable => "ui_unavailable",
            ModeReason::Unlocked => "unlocked",
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self {
            ModeReason::Unlocked => DeliveryMode::Ui,
            ModeReason::Locked | ModeReason::UiUnavailable => DeliveryMode::Headless,
        }
    }
}

impl fmt::Display for ModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AudioClip {
    /// Base64 as received; the UI collaborator decodes it.
    pub data: String,
    pub format: String,
}

impl fmt::Debug for AudioClip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioClip")
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryPayload {
    pub text: String,
    pub audio: Option<AudioClip>,
}

impl DeliveryPayload {
    pub const DEFAULT_AUDIO_FORMAT: &'static str = "m4a";

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }

    pub fn from_parts(text: Option<String>, audio: Option<String>, format: Option<String>) -> Self {
        let audio = audio
            .filter(|data| !data.trim().is_empty())
            .map(|data| AudioClip {
                data,
                format: format
                    .filter(|f| !f.trim().is_empty())
                    .unwrap_or_else(|| Self::DEFAULT_AUDIO_FORMAT.to_string()),
            });
        Self {
            text: text.unwrap_or_default(),
            audio,
        }
    }

    /// Nothing to type: the collaborator only presses enter.
    pub fn is_submit_only(&self) -> bool {
        self.audio.is_none() && self.text.trim().is_empty()
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Only text payloads leave something in the transcript to look for.
    pub fn needs_verification(&self) -> bool {
        self.audio.is_none() && !self.text.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub verified: bool,
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub session_id: String,
    pub mode: DeliveryMode,
    pub reason: ModeReason,
    pub verification: Option<VerificationResult>,
    /// Assistant reply collected in headless mode.
    pub response: Option<String>,
}
