//! Binds opaque terminal windows to discovered sessions.
//!
//! Pure scoring: callers supply the terminals, the sessions and any
//! user-confirmed overrides; nothing here touches the filesystem.

use crate::domain::matching::{
    MatchMethod, MatchResult, TerminalDescriptor, TerminalFingerprint, CONFIRMED_CONFIDENCE,
    MATCH_THRESHOLD,
};
use crate::domain::sessions::Session;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

const PATH_EXACT: u8 = 95;
const PATH_PARTIAL: u8 = 90;
const NAME_EXACT_CASE: u8 = 75;
const NAME_ANY_CASE: u8 = 70;
const OVERLAP_MIN: f64 = 40.0;
const OVERLAP_MAX: f64 = 70.0;
const OVERLAP_RATIO_FLOOR: f64 = 0.5;
const KEYWORD_LIVE: u8 = 50;
const KEYWORD_IDLE: u8 = 35;
const MIN_NAME_LEN: usize = 3;
const KEYWORDS: &[&str] = &["claude", "anthropic"];

static AFTER_COLON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\s*(~?/[^\s:]+)").expect("valid colon path regex"));
static AFTER_DASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-–—]\s+(~?/[^\s:]+)").expect("valid dash path regex"));
static BARE_HOME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(~/[^\s:]*)").expect("valid home path regex"));
static BARE_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(/(?:Users|home)/[^\s:]+)").expect("valid absolute path regex"));

/// Terminals split into bound and unbound for one scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    pub matches: Vec<MatchResult>,
    pub unmatched: Vec<TerminalDescriptor>,
}

#[derive(Clone, Debug)]
struct Candidate {
    confidence: u8,
    method: MatchMethod,
    details: String,
}

impl Candidate {
    fn new(confidence: u8, method: MatchMethod, details: String) -> Self {
        Self {
            confidence,
            method,
            details,
        }
    }

    /// Higher confidence wins; on a tie the earlier heuristic does.
    fn beats(&self, other: &Candidate) -> bool {
        self.confidence > other.confidence
            || (self.confidence == other.confidence && self.method < other.method)
    }
}

#[derive(Clone, Debug, Default)]
pub struct FuzzyMatcher {
    home: Option<String>,
}

impl FuzzyMatcher {
    /// `home` expands `~` in window titles; without it titles only match by suffix.
    pub fn new(home: Option<String>) -> Self {
        let home = home
            .map(|h| h.trim_end_matches('/').to_string())
            .filter(|h| !h.is_empty());
        Self { home }
    }

    pub fn from_env() -> Self {
        Self::new(dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
    }

    pub fn match_terminals(
        &self,
        terminals: &[TerminalDescriptor],
        sessions: &[Session],
        overrides: &BTreeMap<TerminalFingerprint, String>,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        for terminal in terminals {
            match self.best_match(terminal, sessions, overrides) {
                Some(result) => outcome.matches.push(result),
                None => outcome.unmatched.push(terminal.clone()),
            }
        }
        outcome
    }

    fn best_match(
        &self,
        terminal: &TerminalDescriptor,
        sessions: &[Session],
        overrides: &BTreeMap<TerminalFingerprint, String>,
    ) -> Option<MatchResult> {
        if let Some(session_id) = overrides.get(&terminal.fingerprint()) {
            if let Some(session) = sessions.iter().find(|s| s.answers_to(session_id)) {
                return Some(MatchResult {
                    terminal: terminal.clone(),
                    session: session.clone(),
                    confidence: CONFIRMED_CONFIDENCE,
                    method: MatchMethod::Confirmed,
                    details: "confirmed by user".to_string(),
                });
            }
        }

        let mut best: Option<(Candidate, &Session)> = None;
        for session in sessions {
            let Some(candidate) = self.score(&terminal.window_title, session) else {
                continue;
            };
            let replace = match &best {
                Some((current, _)) => candidate.beats(current),
                None => true,
            };
            if replace {
                best = Some((candidate, session));
            }
        }

        let (candidate, session) = best?;
        (candidate.confidence >= MATCH_THRESHOLD).then(|| MatchResult {
            terminal: terminal.clone(),
            session: session.clone(),
            confidence: candidate.confidence,
            method: candidate.method,
            details: candidate.details,
        })
    }

    /// Best heuristic for one title/session pair.
    fn score(&self, title: &str, session: &Session) -> Option<Candidate> {
        [
            self.path_in_title(title, session),
            project_name_in_title(title, session),
            word_overlap(title, session),
            keyword(title, session),
        ]
        .into_iter()
        .flatten()
        .reduce(|best, next| if next.beats(&best) { next } else { best })
    }

    fn path_in_title(&self, title: &str, session: &Session) -> Option<Candidate> {
        let project = session.project_path.trim_end_matches('/');
        if project.is_empty() {
            return None;
        }
        let mut best: Option<Candidate> = None;
        for token in path_tokens(title) {
            let confidence = if self.expand(&token).as_deref() == Some(project) {
                PATH_EXACT
            } else if self.overlaps(&token, project) {
                PATH_PARTIAL
            } else {
                continue;
            };
            if best.as_ref().map_or(true, |b| confidence > b.confidence) {
                best = Some(Candidate::new(
                    confidence,
                    MatchMethod::PathInTitle,
                    format!("title path {token} matches {project}"),
                ));
            }
        }
        best
    }

    fn expand(&self, token: &str) -> Option<String> {
        match token.strip_prefix('~') {
            Some(rest) => self.home.as_ref().map(|home| format!("{home}{rest}")),
            None => Some(token.to_string()),
        }
    }

    /// Title path is the project, a subdirectory of it, or a home-relative
    /// suffix of it. Parent directories never count.
    fn overlaps(&self, token: &str, project: &str) -> bool {
        if self
            .expand(token)
            .is_some_and(|expanded| is_within(&expanded, project))
        {
            return true;
        }
        match token.strip_prefix('~') {
            Some(rest) => rest.len() > 1 && project.ends_with(rest),
            None => false,
        }
    }
}

fn is_within(path: &str, project: &str) -> bool {
    path == project
        || path
            .strip_prefix(project)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn path_tokens(title: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut tokens = Vec::new();
    for regex in [&*AFTER_COLON, &*AFTER_DASH, &*BARE_HOME, &*BARE_ABSOLUTE] {
        for capture in regex.captures_iter(title) {
            let Some(raw) = capture.get(1) else { continue };
            let token = raw
                .as_str()
                .trim_end_matches(|c: char| matches!(c, ')' | ']' | ',' | ';' | '"' | '\''))
                .trim_end_matches('/');
            if token.is_empty() || token == "~" {
                continue;
            }
            if seen.insert(token.to_string()) {
                tokens.push(token.to_string());
            }
        }
    }
    tokens
}

fn project_names(session: &Session) -> Vec<&str> {
    let last = session
        .project_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let mut names = vec![session.display_name.as_str()];
    if last != session.display_name {
        names.push(last);
    }
    names.retain(|name| name.chars().count() >= MIN_NAME_LEN);
    names
}

fn project_name_in_title(title: &str, session: &Session) -> Option<Candidate> {
    let names = project_names(session);
    if let Some(name) = names.iter().find(|name| title.contains(**name)) {
        return Some(Candidate::new(
            NAME_EXACT_CASE,
            MatchMethod::ProjectNameInTitle,
            format!("title contains project name {name}"),
        ));
    }
    let lowered = title.to_lowercase();
    names
        .iter()
        .find(|name| lowered.contains(&name.to_lowercase()))
        .map(|name| {
            Candidate::new(
                NAME_ANY_CASE,
                MatchMethod::ProjectNameInTitle,
                format!("title contains project name {name} (case-insensitive)"),
            )
        })
}

fn tokenize(value: &str) -> BTreeSet<String> {
    value
        .split(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '/'))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn word_overlap(title: &str, session: &Session) -> Option<Candidate> {
    let project_tokens = tokenize(&session.display_name);
    if project_tokens.is_empty() {
        return None;
    }
    let title_tokens = tokenize(title);
    let matching = project_tokens.intersection(&title_tokens).count();
    let ratio = matching as f64 / project_tokens.len() as f64;
    if ratio < OVERLAP_RATIO_FLOOR {
        return None;
    }
    let scale = (ratio - OVERLAP_RATIO_FLOOR) / (1.0 - OVERLAP_RATIO_FLOOR);
    let scaled = OVERLAP_MIN + scale * (OVERLAP_MAX - OVERLAP_MIN);
    Some(Candidate::new(
        scaled.round() as u8,
        MatchMethod::WordOverlap,
        format!("{matching}/{} project words in title", project_tokens.len()),
    ))
}

fn keyword(title: &str, session: &Session) -> Option<Candidate> {
    let lowered = title.to_lowercase();
    let word = KEYWORDS.iter().find(|word| lowered.contains(**word))?;
    let confidence = if session.is_live {
        KEYWORD_LIVE
    } else {
        KEYWORD_IDLE
    };
    Some(Candidate::new(
        confidence,
        MatchMethod::Keyword,
        format!("title mentions {word}"),
    ))
}
