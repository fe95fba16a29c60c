//! Track resolution seam and the bounded blocking worker pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{DownloadError, JukeboxError, ResolveError};
use crate::track::Track;

/// Media fetched to a temporary path, not yet committed to the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    /// Container extension without the leading dot (`webm`, `m4a`, ...).
    pub ext: String,
    pub size_bytes: u64,
}

/// Turns queries into track metadata and fetches media.
///
/// Both calls block; run them through [`WorkerPool`].
pub trait TrackResolver: Send + Sync {
    /// Resolve a direct link or search query to a single track.
    fn resolve(&self, query: &str) -> Result<Track, ResolveError>;

    /// Fetch the media for `track` into `dest`.
    fn download(&self, track: &Track, dest: &Path) -> Result<DownloadedMedia, DownloadError>;
}

/// Temporary download file removed on drop unless kept.
pub struct PartialDownload {
    path: PathBuf,
    keep: bool,
}

impl PartialDownload {
    pub fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file has been moved into place; do not delete it.
    pub fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "removed partial download");
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "partial cleanup failed");
            }
        }
    }
}

/// Bounded pool for blocking work (resolution, download, cache io).
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run `job` on the blocking pool once a slot is free.
    ///
    /// The job keeps running if the returned future is dropped.
    pub async fn run<F, T>(&self, job: F) -> Result<T, JukeboxError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| JukeboxError::WorkerPool(err.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| JukeboxError::WorkerPool(err.to_string()))
    }
}
