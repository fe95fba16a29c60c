use serde::{Deserialize, Serialize};

/// Reason why playback of one track ended.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream/file.
    Eof,
    /// Decoder, transport, or sink error interrupted playback.
    Error,
    /// Playback was explicitly stopped (skip or stop).
    Stopped,
}

/// Why a session left the registry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Queue stayed empty for the whole idle window.
    Idle,
    /// Explicit stop request.
    Stopped,
}

/// Display-oriented view of one queued or playing track.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TrackSummary {
    /// Stable track id supplied by the resolver. Empty for unresolved queries.
    pub id: String,
    /// Track title, or the raw query while unresolved.
    pub title: String,
    /// Public page for the track, if resolved.
    pub webpage_url: Option<String>,
    /// Duration in whole seconds, if known.
    pub duration_secs: Option<u64>,
    /// Thumbnail image URL, if any.
    pub thumbnail_url: Option<String>,
    /// Display name of whoever requested the track.
    pub requested_by: String,
}

/// Request body for `POST /sessions/{id}/queue`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnqueueRequest {
    /// URL or free-text search query.
    pub query: String,
    /// Display name of the requester.
    pub requested_by: String,
    /// Voice target to join when the session does not exist yet.
    #[serde(default)]
    pub voice_target: Option<String>,
    /// Text target used for notifications. Defaults to the voice target.
    #[serde(default)]
    pub text_target: Option<String>,
    /// Queue the raw query and resolve it when it reaches the head of the queue.
    #[serde(default)]
    pub deferred: bool,
}

/// Result of an enqueue request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnqueueResponse {
    /// Track appended to the queue at 1-based `position`.
    Queued { position: usize, track: TrackSummary },
    /// Track exceeds the duration ceiling and was not queued.
    RejectedTooLong {
        title: String,
        duration_secs: u64,
        max_duration_secs: u64,
    },
}

/// Result of a skip request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipResponse {
    Skipped { track: TrackSummary },
    NothingPlaying,
}

/// Result of a stop request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopResponse {
    Stopped,
    NotConnected,
}

/// Result of a pause request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseResponse {
    Paused,
    AlreadyPaused,
    NothingPlaying,
}

/// Result of a resume request.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumeResponse {
    Resumed,
    NotPaused,
    NothingPlaying,
}

/// Queue listing for one session.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueueResponse {
    /// Track currently handed to the audio sink.
    pub now_playing: Option<TrackSummary>,
    /// Upcoming tracks in play order.
    pub upcoming: Vec<TrackSummary>,
    /// Player loop position, e.g. `downloading` or `waiting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_state: Option<String>,
}

/// Live session ids.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionsResponse {
    pub sessions: Vec<String>,
}

/// One entry in the cache statistics listing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheEntrySummary {
    pub track_id: String,
    /// Title from the sidecar metadata, when present.
    pub title: Option<String>,
    pub size_bytes: u64,
}

/// Cache usage report.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CacheStatsResponse {
    pub track_count: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    /// Largest entries, biggest first.
    pub largest_entries: Vec<CacheEntrySummary>,
    /// Track ids with a download currently in flight.
    pub downloads_in_flight: Vec<String>,
}

/// Notification stream consumed by the presentation layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JukeboxEvent {
    TrackQueued {
        session_id: String,
        text_target: String,
        position: usize,
        track: TrackSummary,
    },
    TrackStarted {
        session_id: String,
        text_target: String,
        track: TrackSummary,
        /// `true` when the media came out of the local cache.
        cache_hit: bool,
        /// `true` for the first track after a restart.
        resumed: bool,
        /// Elapsed seconds recorded before the restart. Display only.
        resume_position_secs: Option<u64>,
    },
    TrackEnded {
        session_id: String,
        text_target: String,
        track_id: String,
        reason: PlaybackEndReason,
    },
    TrackRejected {
        session_id: String,
        text_target: String,
        title: String,
        duration_secs: u64,
        max_duration_secs: u64,
    },
    Error {
        session_id: String,
        text_target: String,
        message: String,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
}

impl JukeboxEvent {
    /// Session the event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            JukeboxEvent::TrackQueued { session_id, .. }
            | JukeboxEvent::TrackStarted { session_id, .. }
            | JukeboxEvent::TrackEnded { session_id, .. }
            | JukeboxEvent::TrackRejected { session_id, .. }
            | JukeboxEvent::Error { session_id, .. }
            | JukeboxEvent::SessionClosed { session_id, .. } => session_id,
        }
    }

    /// Short event name used as the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            JukeboxEvent::TrackQueued { .. } => "track_queued",
            JukeboxEvent::TrackStarted { .. } => "track_started",
            JukeboxEvent::TrackEnded { .. } => "track_ended",
            JukeboxEvent::TrackRejected { .. } => "track_rejected",
            JukeboxEvent::Error { .. } => "error",
            JukeboxEvent::SessionClosed { .. } => "session_closed",
        }
    }
}
