//! Audio sink and voice connection seams.
//!
//! Implementations translate playback operations into a concrete transport.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jukebox_types::PlaybackEndReason;
use tokio::sync::oneshot;

use crate::error::SinkError;

/// What the sink should play.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MediaSource {
    /// Committed cache file.
    File(PathBuf),
    /// Direct stream reference, used when caching is disabled.
    Stream(String),
}

impl MediaSource {
    pub fn as_input(&self) -> String {
        match self {
            MediaSource::File(path) => path.to_string_lossy().to_string(),
            MediaSource::Stream(url) => url.clone(),
        }
    }
}

/// Reported once per `play` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackEnd {
    pub reason: PlaybackEndReason,
    pub error: Option<String>,
}

impl PlaybackEnd {
    pub fn eof() -> Self {
        Self {
            reason: PlaybackEndReason::Eof,
            error: None,
        }
    }

    pub fn stopped() -> Self {
        Self {
            reason: PlaybackEndReason::Stopped,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            reason: PlaybackEndReason::Error,
            error: Some(message.into()),
        }
    }
}

/// One-shot completion handle handed to the sink.
///
/// Fires exactly once. Dropping it unfired reports an error so the waiting
/// player is always released.
pub struct PlaybackCompletion {
    tx: Option<oneshot::Sender<PlaybackEnd>>,
}

/// Receiving half of [`PlaybackCompletion`].
pub struct CompletionWait {
    rx: oneshot::Receiver<PlaybackEnd>,
}

impl PlaybackCompletion {
    pub fn channel() -> (PlaybackCompletion, CompletionWait) {
        let (tx, rx) = oneshot::channel();
        (PlaybackCompletion { tx: Some(tx) }, CompletionWait { rx })
    }

    pub fn complete(mut self, end: PlaybackEnd) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(end);
        }
    }
}

impl Drop for PlaybackCompletion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(PlaybackEnd::failed("audio sink dropped the completion handle"));
        }
    }
}

impl CompletionWait {
    pub async fn wait(self) -> PlaybackEnd {
        self.rx
            .await
            .unwrap_or_else(|_| PlaybackEnd::failed("audio sink went away"))
    }
}

/// Transmits audio for one session.
pub trait AudioSink: Send + Sync {
    /// Start playing `source`. `done` fires when playback ends for any reason,
    /// including [`AudioSink::stop`].
    fn play(&self, source: MediaSource, volume: f32, done: PlaybackCompletion)
    -> Result<(), SinkError>;
    fn stop(&self);
    fn pause(&self) -> Result<(), SinkError>;
    fn resume(&self) -> Result<(), SinkError>;
    /// Playing and not paused.
    fn is_playing(&self) -> bool;
    fn is_paused(&self) -> bool;
}

/// Joins and leaves voice targets.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
        voice_target: &str,
    ) -> Result<Arc<dyn AudioSink>, SinkError>;
    async fn disconnect(&self, session_id: &str);
}
