//! Crash-safe session snapshots.
//!
//! The whole session set is written to `<cache_root>/state.snapshot` as JSON via
//! write-then-rename, so a reader only ever sees a complete file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::error::PersistenceError;
use crate::track::{QueueItem, SessionTargets, Track};

pub const SNAPSHOT_FILE: &str = "state.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

fn default_volume() -> f32 {
    0.5
}

/// Durable record of one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub voice_target: String,
    pub text_target: String,
    /// Pending items, with the track that was playing first.
    pub queue: Vec<QueueItem>,
    /// Seconds into the playing track when the snapshot was taken. Display only.
    #[serde(default)]
    pub elapsed_secs: Option<u64>,
    #[serde(default = "default_volume")]
    pub volume: f32,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at_unix: u64,
    sessions: Vec<SessionSnapshot>,
}

/// Live state of one session, as seen by the registry.
pub struct LiveSession {
    pub session_id: String,
    pub targets: SessionTargets,
    pub current: Option<Track>,
    pub elapsed_secs: Option<u64>,
    pub queue: Vec<QueueItem>,
    pub volume: f32,
}

/// Build durable records; sessions with nothing queued or playing are omitted.
pub fn build_snapshot(sessions: impl IntoIterator<Item = LiveSession>) -> Vec<SessionSnapshot> {
    let mut out: Vec<SessionSnapshot> = sessions
        .into_iter()
        .filter(|s| s.current.is_some() || !s.queue.is_empty())
        .map(|s| {
            let elapsed_secs = s.current.as_ref().and(s.elapsed_secs);
            let mut queue = Vec::with_capacity(s.queue.len() + 1);
            if let Some(mut current) = s.current {
                current.cached_file_path = None;
                queue.push(QueueItem::Resolved(current));
            }
            queue.extend(s.queue);
            SessionSnapshot {
                session_id: s.session_id,
                voice_target: s.targets.voice,
                text_target: s.targets.text,
                queue,
                elapsed_secs,
                volume: s.volume,
            }
        })
        .collect();
    out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    out
}

#[derive(Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: &Path) -> Self {
        Self {
            path: root.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot file atomically.
    pub fn save(&self, sessions: &[SessionSnapshot]) -> Result<(), PersistenceError> {
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            saved_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            sessions: sessions.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_file_name(format!("{SNAPSHOT_FILE}.tmp"));
        let result = (|| -> io::Result<()> {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(&data)?;
            out.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Read the snapshot. A missing file is an empty session set.
    pub fn load(&self) -> Result<Vec<SessionSnapshot>, PersistenceError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let file: SnapshotFile = serde_json::from_slice(&data)?;
        if file.version != SNAPSHOT_VERSION {
            return Err(PersistenceError::Version(file.version));
        }
        Ok(file.sessions)
    }

    /// Like [`SnapshotStore::load`], but failures are logged and yield nothing.
    pub fn load_or_empty(&self) -> Vec<SessionSnapshot> {
        match self.load() {
            Ok(sessions) => sessions,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "snapshot restore failed");
                Vec::new()
            }
        }
    }
}

/// Coalescing "please snapshot soon" signal.
#[derive(Clone, Default)]
pub struct SnapshotRequest {
    notify: Arc<Notify>,
}

impl SnapshotRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.notify.notify_one();
    }

    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}
