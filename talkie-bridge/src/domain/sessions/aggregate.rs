use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};

/// A session counts as live only when its transcript moved within this many minutes.
pub const LIVENESS_WINDOW_MINUTES: i64 = 30;

/// A coding-agent conversation discovered on disk.
///
/// Sessions are re-derived on every scan and never persisted; identity is only
/// as stable as the id embedded in the transcript.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub folder_name: String,
    pub project_path: String,
    pub display_name: String,
    pub is_live: bool,
    pub last_seen: DateTime<Utc>,
    pub message_count: usize,
    pub transcript_path: PathBuf,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        folder_name: impl Into<String>,
        project_path: impl Into<String>,
        transcript_path: impl Into<PathBuf>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        let project_path = project_path.into();
        let display_name = display_name_for(&project_path);
        Self {
            id: id.into(),
            folder_name: folder_name.into(),
            project_path,
            display_name,
            is_live: false,
            last_seen,
            message_count: 0,
            transcript_path: transcript_path.into(),
        }
    }

    pub fn with_liveness(mut self, agent_running: bool, now: DateTime<Utc>) -> Self {
        let idle = now.signed_duration_since(self.last_seen);
        self.is_live = agent_running && idle <= Duration::minutes(LIVENESS_WINDOW_MINUTES);
        self
    }

    pub fn with_message_count(mut self, count: usize) -> Self {
        self.message_count = count;
        self
    }

    /// Resolves by opaque id first, then by the encoded project folder.
    pub fn answers_to(&self, key: &str) -> bool {
        self.id == key || self.folder_name == key
    }

    pub fn project_dir(&self) -> Option<&Path> {
        let path = Path::new(&self.project_path);
        path.is_absolute().then_some(path)
    }
}

fn display_name_for(project_path: &str) -> String {
    project_path
        .trim_end_matches('/')
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(project_path)
        .to_string()
}
