use crate::domain::sessions::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matches below this confidence are reported as unmatched.
pub const MATCH_THRESHOLD: u8 = 30;
pub const CONFIRMED_CONFIDENCE: u8 = 100;

/// An opaque terminal window as reported by the UI-automation service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalDescriptor {
    pub bundle_id: String,
    pub window_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
}

impl TerminalDescriptor {
    pub fn new(bundle_id: impl Into<String>, window_title: impl Into<String>) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            window_title: window_title.into(),
            window_id: None,
            app_name: None,
        }
    }

    pub fn fingerprint(&self) -> TerminalFingerprint {
        TerminalFingerprint::from_parts(&self.bundle_id, &self.window_title)
    }
}

/// `bundleId|windowTitle`, the key user-confirmed mappings are stored under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalFingerprint(String);

impl TerminalFingerprint {
    pub fn from_parts(bundle_id: &str, window_title: &str) -> Self {
        Self(format!("{bundle_id}|{window_title}"))
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let Some((bundle_id, _title)) = value.split_once('|') else {
            return Err("terminal fingerprint must look like bundleId|windowTitle".into());
        };
        if bundle_id.trim().is_empty() {
            return Err("terminal fingerprint is missing the bundle id".into());
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TerminalFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Heuristic that produced a match, in tie-break priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchMethod {
    Confirmed,
    PathInTitle,
    ProjectNameInTitle,
    WordOverlap,
    Keyword,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Confirmed => "confirmed",
            MatchMethod::PathInTitle => "path_in_title",
            MatchMethod::ProjectNameInTitle => "project_name",
            MatchMethod::WordOverlap => "word_overlap",
            MatchMethod::Keyword => "keyword",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub terminal: TerminalDescriptor,
    pub session: Session,
    pub confidence: u8,
    pub method: MatchMethod,
    pub details: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchReport {
    pub matches: Vec<MatchResult>,
    pub unmatched: Vec<TerminalDescriptor>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_joins_bundle_and_title() {
        let terminal = TerminalDescriptor::new("com.googlecode.iterm2", "zsh - ~/dev/app");
        assert_eq!(
            terminal.fingerprint().as_str(),
            "com.googlecode.iterm2|zsh - ~/dev/app"
        );
    }

    #[test]
    fn fingerprint_parse_requires_separator() {
        assert!(TerminalFingerprint::parse("no-separator").is_err());
        assert!(TerminalFingerprint::parse("|title").is_err());
        assert!(TerminalFingerprint::parse("com.apple.Terminal|").is_ok());
    }

    #[test]
    fn methods_order_by_priority() {
        assert!(MatchMethod::PathInTitle < MatchMethod::ProjectNameInTitle);
        assert!(MatchMethod::WordOverlap < MatchMethod::Keyword);
    }
}
