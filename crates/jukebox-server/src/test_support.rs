//! Hand-written collaborator doubles shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{DownloadError, ResolveError, SinkError};
use crate::resolver::{DownloadedMedia, TrackResolver};
use crate::sink::{AudioSink, MediaSource, PlaybackCompletion, PlaybackEnd, VoiceConnector};
use crate::track::{Track, track};

pub(crate) const FAKE_MEDIA_BYTES: usize = 64;

/// Resolver with scripted answers and a download call log.
#[derive(Default)]
pub(crate) struct FakeResolver {
    tracks: Mutex<HashMap<String, Track>>,
    downloads: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    download_delay: Mutex<Duration>,
}

impl FakeResolver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, query: &str, track: Track) {
        self.tracks
            .lock()
            .unwrap()
            .insert(query.to_string(), track);
    }

    pub(crate) fn fail_downloads_of(&self, track_id: &str) {
        self.failing.lock().unwrap().insert(track_id.to_string());
    }

    pub(crate) fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock().unwrap() = delay;
    }

    pub(crate) fn download_count(&self, track_id: &str) -> usize {
        self.downloads
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == track_id)
            .count()
    }
}

impl TrackResolver for FakeResolver {
    fn resolve(&self, query: &str) -> Result<Track, ResolveError> {
        if let Some(track) = self.tracks.lock().unwrap().get(query) {
            return Ok(track.clone());
        }
        // `id:<id>:<secs>` resolves without scripting.
        if let Some(rest) = query.strip_prefix("id:") {
            if let Some((id, secs)) = rest.split_once(':') {
                if let Ok(secs) = secs.parse() {
                    return Ok(track(id, secs));
                }
            }
        }
        Err(ResolveError::NotFound(query.to_string()))
    }

    fn download(&self, track: &Track, dest: &Path) -> Result<DownloadedMedia, DownloadError> {
        self.downloads.lock().unwrap().push(track.id.clone());
        let delay = *self.download_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.failing.lock().unwrap().contains(&track.id) {
            return Err(DownloadError::Fetch("scripted failure".to_string()));
        }
        fs::write(dest, vec![7u8; FAKE_MEDIA_BYTES])?;
        Ok(DownloadedMedia {
            path: dest.to_path_buf(),
            ext: "opus".to_string(),
            size_bytes: FAKE_MEDIA_BYTES as u64,
        })
    }
}

#[derive(Clone)]
enum SinkMode {
    Complete(PlaybackEnd),
    Manual,
    Reject,
}

/// Audio sink double recording every call.
pub(crate) struct FakeSink {
    mode: SinkMode,
    plays: Mutex<Vec<(MediaSource, f32)>>,
    pending: Mutex<Option<PlaybackCompletion>>,
    paused: AtomicBool,
    stops: AtomicUsize,
}

impl FakeSink {
    fn with_mode(mode: SinkMode) -> Self {
        Self {
            mode,
            plays: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            paused: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    /// Every track ends immediately at end of stream.
    pub(crate) fn auto_complete() -> Self {
        Self::with_mode(SinkMode::Complete(PlaybackEnd::eof()))
    }

    /// Every track ends immediately with an error.
    pub(crate) fn failing_completion() -> Self {
        Self::with_mode(SinkMode::Complete(PlaybackEnd::failed("decoder exploded")))
    }

    /// Tracks play until [`FakeSink::finish_current`] or `stop`.
    pub(crate) fn manual() -> Self {
        Self::with_mode(SinkMode::Manual)
    }

    /// `play` fails outright.
    pub(crate) fn rejecting() -> Self {
        Self::with_mode(SinkMode::Reject)
    }

    pub(crate) fn plays(&self) -> Vec<(MediaSource, f32)> {
        self.plays.lock().unwrap().clone()
    }

    pub(crate) fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_current(&self, end: PlaybackEnd) {
        self.paused.store(false, Ordering::SeqCst);
        if let Some(done) = self.pending.lock().unwrap().take() {
            done.complete(end);
        }
    }

    fn has_pending(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }
}

impl AudioSink for FakeSink {
    fn play(
        &self,
        source: MediaSource,
        volume: f32,
        done: PlaybackCompletion,
    ) -> Result<(), SinkError> {
        self.plays.lock().unwrap().push((source, volume));
        match &self.mode {
            SinkMode::Reject => Err(SinkError::Rejected("scripted rejection".to_string())),
            SinkMode::Complete(end) => {
                done.complete(end.clone());
                Ok(())
            }
            SinkMode::Manual => {
                self.paused.store(false, Ordering::SeqCst);
                *self.pending.lock().unwrap() = Some(done);
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.finish_current(PlaybackEnd::stopped());
    }

    fn pause(&self) -> Result<(), SinkError> {
        if !self.has_pending() {
            return Err(SinkError::Rejected("nothing is playing".to_string()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), SinkError> {
        if !self.has_pending() {
            return Err(SinkError::Rejected("nothing is playing".to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.has_pending() && !self.paused.load(Ordering::SeqCst)
    }

    fn is_paused(&self) -> bool {
        self.has_pending() && self.paused.load(Ordering::SeqCst)
    }
}

/// Connector handing out one [`FakeSink`] per session.
pub(crate) struct FakeConnector {
    make_sink: fn() -> FakeSink,
    sinks: Mutex<HashMap<String, Arc<FakeSink>>>,
    connects: Mutex<Vec<(String, String)>>,
    disconnects: Mutex<Vec<String>>,
    refuse: AtomicBool,
    connect_delays: Mutex<HashMap<String, Duration>>,
    disconnect_delay: Mutex<Duration>,
}

impl FakeConnector {
    pub(crate) fn new(make_sink: fn() -> FakeSink) -> Self {
        Self {
            make_sink,
            sinks: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
            connect_delays: Mutex::new(HashMap::new()),
            disconnect_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn delay_connect(&self, session_id: &str, delay: Duration) {
        self.connect_delays
            .lock()
            .unwrap()
            .insert(session_id.to_string(), delay);
    }

    pub(crate) fn set_disconnect_delay(&self, delay: Duration) {
        *self.disconnect_delay.lock().unwrap() = delay;
    }

    pub(crate) fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub(crate) fn sink(&self, session_id: &str) -> Option<Arc<FakeSink>> {
        self.sinks.lock().unwrap().get(session_id).cloned()
    }

    pub(crate) fn connects(&self) -> Vec<(String, String)> {
        self.connects.lock().unwrap().clone()
    }

    pub(crate) fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceConnector for FakeConnector {
    async fn connect(
        &self,
        session_id: &str,
        voice_target: &str,
    ) -> Result<Arc<dyn AudioSink>, SinkError> {
        let delay = self.connect_delays.lock().unwrap().get(session_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SinkError::Disconnected(voice_target.to_string()));
        }
        self.connects
            .lock()
            .unwrap()
            .push((session_id.to_string(), voice_target.to_string()));
        let sink = Arc::new((self.make_sink)());
        self.sinks
            .lock()
            .unwrap()
            .insert(session_id.to_string(), sink.clone());
        let sink: Arc<dyn AudioSink> = sink;
        Ok(sink)
    }

    async fn disconnect(&self, session_id: &str) {
        let delay = *self.disconnect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.disconnects.lock().unwrap().push(session_id.to_string());
    }
}
