//! Error taxonomy for the playback core.
//!
//! Collaborators report through their own narrow error types; the registry and
//! player fold them into [`JukeboxError`].

use thiserror::Error;

/// Track rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("`{title}` is {duration_secs}s long; the limit is {max_duration_secs}s")]
    TooLong {
        title: String,
        duration_secs: u64,
        max_duration_secs: u64,
    },
}

/// Failure turning a query into track metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no results for `{0}`")]
    NotFound(String),
    #[error("unsupported media: {0}")]
    Unsupported(String),
    #[error("resolver backend failed: {0}")]
    Backend(String),
}

/// Failure fetching media into the cache.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("cache write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("download of `{0}` failed in another session")]
    Abandoned(String),
}

/// Failure reported by an audio sink or voice connector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("audio sink rejected playback: {0}")]
    Rejected(String),
    #[error("voice connection unavailable: {0}")]
    Disconnected(String),
}

/// Snapshot write or restore failure. Logged, never shown to users.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("unsupported snapshot version {0}")]
    Version(u32),
}

#[derive(Debug, Error)]
pub enum JukeboxError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    PlaybackStart(#[from] SinkError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("session `{0}` is closed")]
    SessionClosed(String),
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("worker pool job failed: {0}")]
    WorkerPool(String),
}

impl JukeboxError {
    /// `true` for failures caused by the session being torn down.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, JukeboxError::SessionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_long_message_is_descriptive() {
        let err = JukeboxError::from(ValidationError::TooLong {
            title: "Live set".to_string(),
            duration_secs: 700,
            max_duration_secs: 600,
        });
        assert_eq!(err.to_string(), "`Live set` is 700s long; the limit is 600s");
    }

    #[test]
    fn session_closed_is_detected() {
        assert!(JukeboxError::SessionClosed("g1".to_string()).is_session_closed());
        assert!(!JukeboxError::NotConnected.is_session_closed());
    }
}
