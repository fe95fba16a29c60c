//! Per-session playback status.
//!
//! Written only by the session's player task; read by the registry for queue
//! listings, skip decisions and snapshots.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tokio::sync::watch;

use crate::track::Track;

/// Player state machine position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Resolving,
    CacheLookup,
    Downloading,
    Playing,
    Waiting,
    Destroyed,
}

impl PlayerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayerState::Idle => "idle",
            PlayerState::Resolving => "resolving",
            PlayerState::CacheLookup => "cache_lookup",
            PlayerState::Downloading => "downloading",
            PlayerState::Playing => "playing",
            PlayerState::Waiting => "waiting",
            PlayerState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Default)]
struct SessionStatus {
    current: Option<Track>,
    started_at: Option<SystemTime>,
    cache_hit: bool,
    resumed: bool,
    resume_position_secs: Option<u64>,
}

#[derive(Clone)]
pub struct StatusStore {
    inner: Arc<Mutex<SessionStatus>>,
    state: Arc<watch::Sender<PlayerState>>,
}

impl StatusStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PlayerState::Idle);
        Self {
            inner: Arc::new(Mutex::new(SessionStatus::default())),
            state: Arc::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn on_play(&self, track: Track, cache_hit: bool) {
        let mut s = self.lock();
        s.current = Some(track);
        s.started_at = Some(SystemTime::now());
        s.cache_hit = cache_hit;
    }

    /// Clear the current track and return it.
    pub fn on_track_end(&self) -> Option<Track> {
        let mut s = self.lock();
        s.started_at = None;
        s.cache_hit = false;
        s.current.take()
    }

    pub fn current(&self) -> Option<Track> {
        self.lock().current.clone()
    }

    /// Seconds since the current track started. Pauses are not subtracted.
    pub fn elapsed_secs(&self) -> Option<u64> {
        let s = self.lock();
        s.current.as_ref()?;
        let started = s.started_at?;
        Some(
            SystemTime::now()
                .duration_since(started)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        )
    }

    /// Flag the next start as a post-restart resumption.
    pub fn mark_resumed(&self, resume_position_secs: Option<u64>) {
        let mut s = self.lock();
        s.resumed = true;
        s.resume_position_secs = resume_position_secs;
    }

    /// Consume the resume flag. `Some(position)` when set.
    pub fn take_resume(&self) -> Option<Option<u64>> {
        let mut s = self.lock();
        if !s.resumed {
            return None;
        }
        s.resumed = false;
        Some(s.resume_position_secs.take())
    }

    pub fn set_state(&self, state: PlayerState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
