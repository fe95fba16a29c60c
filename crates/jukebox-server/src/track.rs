//! Track and queue item records.

use std::path::PathBuf;

use jukebox_types::TrackSummary;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Resolved metadata for one playable item.
///
/// Immutable once resolved, except `cached_file_path` which is filled in after a
/// successful download.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Stable id supplied by the resolver; also the cache key.
    pub id: String,
    pub title: String,
    pub webpage_url: String,
    /// Direct stream reference handed to the sink when caching is disabled.
    pub stream_ref: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_file_path: Option<PathBuf>,
}

impl Track {
    pub fn with_requester(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = requested_by.into();
        self
    }

    pub fn with_cached_path(mut self, path: PathBuf) -> Self {
        self.cached_file_path = Some(path);
        self
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            webpage_url: Some(self.webpage_url.clone()),
            duration_secs: Some(self.duration_secs),
            thumbnail_url: self.thumbnail_url.clone(),
            requested_by: self.requested_by.clone(),
        }
    }
}

/// Reject tracks longer than `max_duration_secs`.
pub fn validate_duration(track: &Track, max_duration_secs: u64) -> Result<(), ValidationError> {
    if track.duration_secs > max_duration_secs {
        return Err(ValidationError::TooLong {
            title: track.title.clone(),
            duration_secs: track.duration_secs,
            max_duration_secs,
        });
    }
    Ok(())
}

/// One element of a session queue.
///
/// Most items are resolved at enqueue time; deferred requests carry the raw query
/// and are resolved by the player when they reach the head of the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueItem {
    Resolved(Track),
    Query { query: String, requested_by: String },
}

impl QueueItem {
    pub fn summary(&self) -> TrackSummary {
        match self {
            QueueItem::Resolved(track) => track.summary(),
            QueueItem::Query {
                query,
                requested_by,
            } => TrackSummary {
                id: String::new(),
                title: query.clone(),
                webpage_url: None,
                duration_secs: None,
                thumbnail_url: None,
                requested_by: requested_by.clone(),
            },
        }
    }

    pub fn as_track(&self) -> Option<&Track> {
        match self {
            QueueItem::Resolved(track) => Some(track),
            QueueItem::Query { .. } => None,
        }
    }
}

/// Where a session plays audio and where it reports to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTargets {
    pub voice: String,
    pub text: String,
}

#[cfg(test)]
pub(crate) fn track(id: &str, duration_secs: u64) -> Track {
    Track {
        id: id.to_string(),
        title: format!("Track {id}"),
        webpage_url: format!("https://media.example/watch?v={id}"),
        stream_ref: format!("https://cdn.example/{id}.webm"),
        duration_secs,
        thumbnail_url: None,
        requested_by: "tester".to_string(),
        cached_file_path: None,
    }
}
