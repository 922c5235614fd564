use crate::domain::sessions::Session;
use crate::ports::sessions::{AgentProcessProbe, SessionSource};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::debug;
use uuid::Uuid;

const TRANSCRIPT_EXT: &str = "jsonl";
const AGENT_PREFIX: &str = "agent-";

/// Reads sessions straight from the agent's per-project transcript folders.
pub struct FsSessionStore {
    root: PathBuf,
    probe: Arc<dyn AgentProcessProbe>,
    counter: Arc<MessageCounter>,
}

impl FsSessionStore {
    pub fn new(root: impl Into<PathBuf>, probe: Arc<dyn AgentProcessProbe>) -> Self {
        Self {
            root: root.into(),
            probe,
            counter: Arc::new(MessageCounter::default()),
        }
    }
}

#[async_trait]
impl SessionSource for FsSessionStore {
    async fn scan(&self) -> anyhow::Result<Vec<Session>> {
        let agent_running = self.probe.agent_running().await;
        let root = self.root.clone();
        let counter = Arc::clone(&self.counter);
        tokio::task::spawn_blocking(move || {
            let sessions = scan_root(&root, &counter, agent_running, Utc::now())?;
            counter.retain(sessions.iter().map(|session| session.transcript_path.as_path()));
            Ok(sessions)
        })
        .await
        .context("session scan task panicked")?
    }

    async fn find(&self, id: &str) -> anyhow::Result<Option<Session>> {
        let agent_running = self.probe.agent_running().await;
        let root = self.root.clone();
        let counter = Arc::clone(&self.counter);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let now = Utc::now();
            // Folder names are cheap to check directly; ids need a scan.
            if !id.contains('/') && !id.starts_with('.') {
                let direct = root.join(&id);
                if direct.is_dir() {
                    if let Some(session) = read_project(&direct, &counter, agent_running, now) {
                        if session.answers_to(&id) {
                            return Ok(Some(session));
                        }
                    }
                }
            }
            let sessions = scan_root(&root, &counter, agent_running, now)?;
            Ok(sessions.into_iter().find(|session| session.answers_to(&id)))
        })
        .await
        .context("session lookup task panicked")?
    }
}

/// Fails only when the root itself cannot be listed; a missing root is empty.
fn scan_root(
    root: &Path,
    counter: &MessageCounter,
    agent_running: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<Session>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(root)
        .with_context(|| format!("listing projects directory {}", root.display()))?;

    let mut sessions: Vec<Session> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|dir| read_project(&dir, counter, agent_running, now))
        .collect();
    sessions.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
    Ok(sessions)
}

struct Transcript {
    path: PathBuf,
    modified: SystemTime,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptHeader {
    session_id: Option<String>,
    cwd: Option<String>,
}

#[derive(Deserialize)]
struct TranscriptLine {
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn read_project(
    dir: &Path,
    counter: &MessageCounter,
    agent_running: bool,
    now: DateTime<Utc>,
) -> Option<Session> {
    let folder_name = dir.file_name()?.to_str()?.to_string();
    let transcripts = match list_transcripts(dir) {
        Ok(list) => list,
        Err(err) => {
            debug!(dir = %dir.display(), %err, "skipping unreadable project directory");
            return None;
        }
    };

    let (mut agents, primaries): (Vec<_>, Vec<_>) =
        transcripts.into_iter().partition(|t| is_agent_transcript(&t.path));
    let primary = primaries.into_iter().max_by_key(|t| t.modified)?;

    let mut header = read_header(&primary.path).unwrap_or_default();
    if header.session_id.is_none() && stem_is_uuid(&primary.path) {
        agents.sort_by(|a, b| b.modified.cmp(&a.modified));
        if let Some(companion) = agents
            .iter()
            .filter_map(|t| read_header(&t.path))
            .find(|h| h.session_id.is_some())
        {
            header.session_id = companion.session_id;
            header.cwd = header.cwd.or(companion.cwd);
        }
    }

    let id = header.session_id.unwrap_or_else(|| folder_name.clone());
    let project_path = header
        .cwd
        .filter(|cwd| !cwd.trim().is_empty())
        .or_else(|| resolve_encoded_path(&folder_name))
        .unwrap_or_else(|| naive_decode(&folder_name));
    let last_seen: DateTime<Utc> = primary.modified.into();
    let message_count = counter.count(&primary.path);

    Some(
        Session::new(id, folder_name, project_path, primary.path, last_seen)
            .with_message_count(message_count)
            .with_liveness(agent_running, now),
    )
}

fn list_transcripts(dir: &Path) -> std::io::Result<Vec<Transcript>> {
    let mut transcripts = Vec::new();
    for entry in fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(TRANSCRIPT_EXT) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        transcripts.push(Transcript { path, modified });
    }
    Ok(transcripts)
}

fn is_agent_transcript(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(AGENT_PREFIX))
}

fn stem_is_uuid(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| Uuid::parse_str(stem).is_ok())
}

/// First line only; a malformed line means no embedded metadata.
fn read_header(path: &Path) -> Option<TranscriptHeader> {
    let file = fs::File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    let mut header: TranscriptHeader = serde_json::from_str(first.trim()).ok()?;
    header.session_id = header.session_id.filter(|id| {
        let valid = Uuid::parse_str(id).is_ok();
        if !valid {
            debug!(path = %path.display(), session_id = %id, "ignoring non-uuid session id");
        }
        valid
    });
    Some(header)
}

/// Message tallies per transcript. Transcripts are append-only, so a grown
/// file is counted from where the last pass stopped.
#[derive(Default)]
struct MessageCounter {
    tallies: Mutex<HashMap<PathBuf, Tally>>,
}

#[derive(Clone, Copy, Debug)]
struct Tally {
    /// End of the last complete line counted.
    offset: u64,
    len: u64,
    modified: SystemTime,
    complete: usize,
    /// 1 when the file ends in an unterminated message line.
    partial: usize,
}

impl MessageCounter {
    fn count(&self, path: &Path) -> usize {
        let Ok(metadata) = fs::metadata(path) else {
            return 0;
        };
        let len = metadata.len();
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let previous = self.lock().get(path).copied();
        let (offset, complete) = match previous {
            Some(tally) if tally.len == len && tally.modified == modified => {
                return tally.complete + tally.partial;
            }
            Some(tally) if tally.offset <= len => (tally.offset, tally.complete),
            _ => (0, 0),
        };
        let Ok(scan) = count_from(path, offset) else {
            return complete;
        };
        let tally = Tally {
            offset: scan.offset,
            len,
            modified,
            complete: complete + scan.complete,
            partial: scan.partial,
        };
        self.lock().insert(path.to_path_buf(), tally);
        tally.complete + tally.partial
    }

    /// Forgets transcripts that are no longer any session's primary.
    fn retain<'a>(&self, live: impl Iterator<Item = &'a Path>) {
        let live: HashSet<&Path> = live.collect();
        self.lock().retain(|path, _| live.contains(path.as_path()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Tally>> {
        self.tallies.lock().expect("message tallies poisoned")
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock().len()
    }
}

struct ScanFrom {
    offset: u64,
    complete: usize,
    partial: usize,
}

fn count_from(path: &Path, offset: u64) -> std::io::Result<ScanFrom> {
    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    let mut scan = ScanFrom {
        offset,
        complete: 0,
        partial: 0,
    };
    let mut line = String::new();
    loop {
        line.clear();
        // unreadable bytes end the count, as a line reader would
        let Ok(read) = reader.read_line(&mut line) else {
            break;
        };
        if read == 0 {
            break;
        }
        let message = is_message(&line);
        if !line.ends_with('\n') {
            scan.partial = usize::from(message);
            break;
        }
        scan.offset += read as u64;
        scan.complete += usize::from(message);
    }
    Ok(scan)
}

fn is_message(line: &str) -> bool {
    serde_json::from_str::<TranscriptLine>(line.trim())
        .is_ok_and(|line| matches!(line.kind.as_deref(), Some("user") | Some("assistant")))
}

/// Folder names replace `/` with `-`, which is ambiguous for paths that
/// contain dashes; probe the filesystem to find the split that exists.
fn resolve_encoded_path(encoded: &str) -> Option<String> {
    let rest = encoded.strip_prefix('-')?;
    if rest.is_empty() {
        return None;
    }
    let parts: Vec<&str> = rest.split('-').collect();
    for split in 1..=parts.len() {
        let candidate = format!("/{}", parts[..split].join("/"));
        if !Path::new(&candidate).exists() {
            continue;
        }
        if split == parts.len() {
            return Some(candidate);
        }
        let full = format!("{}/{}", candidate, parts[split..].join("-"));
        if Path::new(&full).exists() {
            return Some(full);
        }
    }
    None
}

fn naive_decode(encoded: &str) -> String {
    if encoded.starts_with('-') {
        encoded.replace('-', "/")
    } else {
        encoded.to_string()
    }
}
