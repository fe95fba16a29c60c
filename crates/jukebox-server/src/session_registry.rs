//! Session registry.
//!
//! Owns the map from session id to its running player and is the only entry
//! point for collaborator commands. Sessions are created on the first enqueue
//! that carries a voice target and leave the map through [`SessionTeardown`].
//! Voice connects happen outside the map lock; concurrent creators of the same
//! id wait on a per-id pending entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use jukebox_types::{
    CacheStatsResponse, EnqueueRequest, EnqueueResponse, JukeboxEvent, PauseResponse,
    QueueResponse, ResumeResponse, SkipResponse, StopResponse,
};
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DownloadError, JukeboxError, PersistenceError, ResolveError, ValidationError};
use crate::persistence::{LiveSession, SnapshotStore, build_snapshot};
use crate::player::{PlaybackServices, PlayerContext, SessionPlayer, SessionTeardown};
use crate::queue::SessionQueue;
use crate::sink::{AudioSink, VoiceConnector};
use crate::status_store::StatusStore;
use crate::track::{QueueItem, SessionTargets, validate_duration};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const STATS_LARGEST_ENTRIES: usize = 10;

struct SessionHandle {
    generation: u64,
    targets: SessionTargets,
    queue: Arc<SessionQueue>,
    sink: Arc<dyn AudioSink>,
    status: StatusStore,
    volume: f32,
    /// Taken by the first `stop`.
    task: Option<JoinHandle<()>>,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;
/// Ids whose voice connect is in flight. The receiver errors once the
/// creator finishes or gives up.
type PendingMap = StdMutex<HashMap<String, watch::Receiver<()>>>;

/// Cheap clones of the parts of a session callers need outside the lock.
#[derive(Clone)]
struct SessionRef {
    queue: Arc<SessionQueue>,
    targets: SessionTargets,
}

struct RegistryInner {
    sessions: SessionMap,
    pending: PendingMap,
    services: PlaybackServices,
    connector: Arc<dyn VoiceConnector>,
    snapshots: SnapshotStore,
    persist_lock: Mutex<()>,
    next_generation: AtomicU64,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

/// Teardown capability handed to players: a weak view of the session map plus
/// the voice connector.
struct RegistryTeardown {
    sessions: Weak<Mutex<HashMap<String, SessionHandle>>>,
    connector: Arc<dyn VoiceConnector>,
}

#[async_trait]
impl SessionTeardown for RegistryTeardown {
    async fn release(&self, session_id: &str, generation: u64) {
        match self.sessions.upgrade() {
            Some(sessions) => {
                release_session(&sessions, self.connector.as_ref(), session_id, generation).await
            }
            None => self.connector.disconnect(session_id).await,
        }
    }
}

/// Disconnect and unmap `generation` of a session.
///
/// The closed entry stays mapped until voice is gone, so no replacement can
/// connect in between. A newer generation is left alone.
async fn release_session(
    sessions: &Mutex<HashMap<String, SessionHandle>>,
    connector: &dyn VoiceConnector,
    session_id: &str,
    generation: u64,
) {
    let owns_connection = match sessions.lock().await.get(session_id) {
        Some(handle) => handle.generation == generation,
        None => true,
    };
    if !owns_connection {
        return;
    }
    connector.disconnect(session_id).await;
    let mut sessions = sessions.lock().await;
    if sessions
        .get(session_id)
        .is_some_and(|handle| handle.generation == generation)
    {
        sessions.remove(session_id);
    }
}

/// Clears the pending entry of a connect when dropped, waking its waiters.
struct PendingConnect<'a> {
    pending: &'a PendingMap,
    session_id: String,
    _done: watch::Sender<()>,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&self.session_id);
    }
}

impl SessionRegistry {
    /// Build the registry and start its snapshot writer on the current runtime.
    pub fn new(
        services: PlaybackServices,
        connector: Arc<dyn VoiceConnector>,
        snapshots: SnapshotStore,
    ) -> Self {
        let inner = Arc::new(RegistryInner {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            pending: StdMutex::new(HashMap::new()),
            services,
            connector,
            snapshots,
            persist_lock: Mutex::new(()),
            next_generation: AtomicU64::new(0),
            runtime: Handle::current(),
            shutdown: CancellationToken::new(),
        });
        spawn_snapshot_writer(&inner);
        Self { inner }
    }

    pub fn services(&self) -> &PlaybackServices {
        &self.inner.services
    }

    /// Resolve `request.query` and append it to the session queue.
    pub async fn enqueue(
        &self,
        session_id: &str,
        request: EnqueueRequest,
    ) -> Result<EnqueueResponse, JukeboxError> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(ResolveError::NotFound(query).into());
        }
        let existing = self.existing_targets(session_id).await?;
        if existing.is_none() && request.voice_target.is_none() {
            return Err(JukeboxError::NotConnected);
        }

        if request.deferred {
            return self
                .enqueue_item(
                    session_id,
                    &request,
                    QueueItem::Query {
                        query,
                        requested_by: request.requested_by.clone(),
                    },
                )
                .await;
        }

        let resolver = self.inner.services.resolver.clone();
        let track = self
            .inner
            .services
            .pool
            .run(move || resolver.resolve(&query))
            .await??
            .with_requester(request.requested_by.clone());

        let max = self.inner.services.settings.max_duration_secs;
        if let Err(ValidationError::TooLong {
            title,
            duration_secs,
            max_duration_secs,
        }) = validate_duration(&track, max)
        {
            let text_target = existing
                .map(|targets| targets.text)
                .unwrap_or_else(|| requested_targets(session_id, &request).text);
            tracing::info!(session_id = %session_id, title = %title, duration_secs, "track rejected");
            self.inner.services.events.publish(JukeboxEvent::TrackRejected {
                session_id: session_id.to_string(),
                text_target,
                title: title.clone(),
                duration_secs,
                max_duration_secs,
            });
            return Ok(EnqueueResponse::RejectedTooLong {
                title,
                duration_secs,
                max_duration_secs,
            });
        }

        self.enqueue_item(session_id, &request, QueueItem::Resolved(track))
            .await
    }

    /// Queue a raw query; the player resolves it when it reaches the head.
    pub async fn enqueue_deferred(
        &self,
        session_id: &str,
        query: &str,
        requested_by: &str,
        voice_target: Option<String>,
    ) -> Result<EnqueueResponse, JukeboxError> {
        self.enqueue(
            session_id,
            EnqueueRequest {
                query: query.to_string(),
                requested_by: requested_by.to_string(),
                voice_target,
                text_target: None,
                deferred: true,
            },
        )
        .await
    }

    async fn enqueue_item(
        &self,
        session_id: &str,
        request: &EnqueueRequest,
        item: QueueItem,
    ) -> Result<EnqueueResponse, JukeboxError> {
        let session = self
            .get_or_create(session_id, requested_targets(session_id, request), None)
            .await?;
        let summary = item.summary();
        let position = session.queue.enqueue(item)?;
        tracing::info!(
            session_id = %session_id,
            position,
            title = %summary.title,
            "track queued"
        );
        self.inner.services.events.publish(JukeboxEvent::TrackQueued {
            session_id: session_id.to_string(),
            text_target: session.targets.text.clone(),
            position,
            track: summary.clone(),
        });
        self.inner.services.snapshots.request();
        Ok(EnqueueResponse::Queued {
            position,
            track: summary,
        })
    }

    /// Targets of a live session, or `SessionClosed` while it is tearing down.
    async fn existing_targets(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionTargets>, JukeboxError> {
        let sessions = self.inner.sessions.lock().await;
        match sessions.get(session_id) {
            Some(handle) if handle.queue.is_closed() => {
                Err(JukeboxError::SessionClosed(session_id.to_string()))
            }
            Some(handle) => Ok(Some(handle.targets.clone())),
            None => Ok(None),
        }
    }

    async fn get_or_create(
        &self,
        session_id: &str,
        targets: SessionTargets,
        volume: Option<f32>,
    ) -> Result<SessionRef, JukeboxError> {
        let claim = loop {
            let mut waiting = {
                let sessions = self.inner.sessions.lock().await;
                if let Some(handle) = sessions.get(session_id) {
                    if handle.queue.is_closed() {
                        return Err(JukeboxError::SessionClosed(session_id.to_string()));
                    }
                    return Ok(SessionRef {
                        queue: handle.queue.clone(),
                        targets: handle.targets.clone(),
                    });
                }
                let mut pending = self
                    .inner
                    .pending
                    .lock()
                    .unwrap_or_else(|err| err.into_inner());
                match pending.get(session_id) {
                    Some(waiting) => waiting.clone(),
                    None => {
                        let (done, waiting) = watch::channel(());
                        pending.insert(session_id.to_string(), waiting);
                        break PendingConnect {
                            pending: &self.inner.pending,
                            session_id: session_id.to_string(),
                            _done: done,
                        };
                    }
                }
            };
            // Another caller is connecting this id; look again once it is done.
            let _ = waiting.changed().await;
        };

        let sink = self
            .inner
            .connector
            .connect(session_id, &targets.voice)
            .await?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let queue = Arc::new(SessionQueue::new(session_id, cancel.clone()));
        let status = StatusStore::new();
        let volume = volume
            .unwrap_or(self.inner.services.settings.default_volume)
            .clamp(0.0, 1.0);
        let teardown = Arc::new(RegistryTeardown {
            sessions: Arc::downgrade(&self.inner.sessions),
            connector: self.inner.connector.clone(),
        });
        let player = SessionPlayer::new(
            PlayerContext {
                session_id: session_id.to_string(),
                generation,
                targets: targets.clone(),
                queue: queue.clone(),
                sink: sink.clone(),
                status: status.clone(),
                volume,
                cancel,
            },
            self.inner.services.clone(),
            teardown,
        );

        let mut sessions = self.inner.sessions.lock().await;
        let task = self.inner.runtime.spawn(player.run());
        tracing::info!(
            session_id = %session_id,
            voice_target = %targets.voice,
            generation,
            "session created"
        );
        sessions.insert(
            session_id.to_string(),
            SessionHandle {
                generation,
                targets: targets.clone(),
                queue: queue.clone(),
                sink,
                status,
                volume,
                task: Some(task),
            },
        );
        drop(claim);
        Ok(SessionRef { queue, targets })
    }

    /// Stop the current track; the player advances on its own.
    pub async fn skip(&self, session_id: &str) -> SkipResponse {
        let sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.get(session_id) else {
            return SkipResponse::NothingPlaying;
        };
        let Some(current) = handle.status.current() else {
            return SkipResponse::NothingPlaying;
        };
        if !handle.sink.is_playing() && !handle.sink.is_paused() {
            return SkipResponse::NothingPlaying;
        }
        handle.sink.stop();
        tracing::info!(session_id = %session_id, track_id = %current.id, "skipped");
        SkipResponse::Skipped {
            track: current.summary(),
        }
    }

    /// Clear the queue, stop playback, leave voice and destroy the session.
    ///
    /// The entry stays mapped, closed, until the player releases it, so
    /// enqueues racing with the stop see `SessionClosed`.
    pub async fn stop(&self, session_id: &str) -> StopResponse {
        let (generation, task) = {
            let mut sessions = self.inner.sessions.lock().await;
            let Some(handle) = sessions.get_mut(session_id) else {
                return StopResponse::NotConnected;
            };
            handle.queue.clear();
            handle.queue.close();
            handle.sink.stop();
            (handle.generation, handle.task.take())
        };
        let Some(task) = task else {
            // Already stopping.
            return StopResponse::Stopped;
        };

        let abort = task.abort_handle();
        if tokio::time::timeout(STOP_JOIN_TIMEOUT, task).await.is_err() {
            tracing::warn!(session_id = %session_id, "player did not stop in time");
            abort.abort();
            release_session(
                &self.inner.sessions,
                self.inner.connector.as_ref(),
                session_id,
                generation,
            )
            .await;
        }
        tracing::info!(session_id = %session_id, "session stopped");
        StopResponse::Stopped
    }

    pub async fn pause(&self, session_id: &str) -> Result<PauseResponse, JukeboxError> {
        let sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.get(session_id) else {
            return Ok(PauseResponse::NothingPlaying);
        };
        if handle.sink.is_paused() {
            return Ok(PauseResponse::AlreadyPaused);
        }
        if !handle.sink.is_playing() {
            return Ok(PauseResponse::NothingPlaying);
        }
        handle.sink.pause()?;
        Ok(PauseResponse::Paused)
    }

    pub async fn resume(&self, session_id: &str) -> Result<ResumeResponse, JukeboxError> {
        let sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.get(session_id) else {
            return Ok(ResumeResponse::NothingPlaying);
        };
        if handle.sink.is_paused() {
            handle.sink.resume()?;
            return Ok(ResumeResponse::Resumed);
        }
        if handle.sink.is_playing() {
            return Ok(ResumeResponse::NotPaused);
        }
        Ok(ResumeResponse::NothingPlaying)
    }

    /// Current track and pending items, in play order.
    pub async fn list_queue(&self, session_id: &str) -> QueueResponse {
        let sessions = self.inner.sessions.lock().await;
        let Some(handle) = sessions.get(session_id) else {
            return QueueResponse::default();
        };
        QueueResponse {
            now_playing: handle.status.current().map(|track| track.summary()),
            upcoming: handle
                .queue
                .snapshot()
                .iter()
                .map(QueueItem::summary)
                .collect(),
            player_state: Some(handle.status.state().as_str().to_string()),
        }
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn cache_stats(&self) -> Result<CacheStatsResponse, JukeboxError> {
        let cache = self.inner.services.cache.clone();
        self.inner
            .services
            .pool
            .run(move || cache.stats(STATS_LARGEST_ENTRIES))
            .await?
            .map_err(|err| DownloadError::Io(err).into())
    }

    /// Write the snapshot of every live session now.
    pub async fn persist_now(&self) -> Result<usize, PersistenceError> {
        persist(&self.inner).await
    }

    /// Recreate sessions from the last snapshot. Returns how many came back.
    pub async fn restore(&self) -> usize {
        let store = self.inner.snapshots.clone();
        let snapshot = match self.inner.services.pool.run(move || store.load_or_empty()).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "snapshot restore failed");
                return 0;
            }
        };

        let mut restored = 0usize;
        for session in snapshot {
            let targets = SessionTargets {
                voice: session.voice_target.clone(),
                text: session.text_target.clone(),
            };
            let created = match self
                .get_or_create(&session.session_id, targets, Some(session.volume))
                .await
            {
                Ok(created) => created,
                Err(err) => {
                    tracing::warn!(
                        session_id = %session.session_id,
                        error = %err,
                        "session restore failed"
                    );
                    continue;
                }
            };
            if let Some(handle) = self.inner.sessions.lock().await.get(&session.session_id) {
                handle.status.mark_resumed(session.elapsed_secs);
            }
            let count = session.queue.len();
            if let Err(err) = created.queue.extend(session.queue) {
                tracing::warn!(session_id = %session.session_id, error = %err, "session restore failed");
                continue;
            }
            tracing::info!(
                session_id = %session.session_id,
                tracks = count,
                elapsed_secs = ?session.elapsed_secs,
                "session restored"
            );
            restored += 1;
        }
        restored
    }
}

fn requested_targets(session_id: &str, request: &EnqueueRequest) -> SessionTargets {
    let voice = request
        .voice_target
        .clone()
        .unwrap_or_else(|| session_id.to_string());
    let text = request.text_target.clone().unwrap_or_else(|| voice.clone());
    SessionTargets { voice, text }
}

async fn persist(inner: &RegistryInner) -> Result<usize, PersistenceError> {
    let _guard = inner.persist_lock.lock().await;
    let live: Vec<LiveSession> = {
        let sessions = inner.sessions.lock().await;
        sessions
            .iter()
            .map(|(session_id, handle)| LiveSession {
                session_id: session_id.clone(),
                targets: handle.targets.clone(),
                current: handle.status.current(),
                elapsed_secs: handle.status.elapsed_secs(),
                queue: handle.queue.snapshot(),
                volume: handle.volume,
            })
            .collect()
    };
    let snapshot = build_snapshot(live);
    let count = snapshot.len();
    let store = inner.snapshots.clone();
    inner
        .services
        .pool
        .run(move || store.save(&snapshot))
        .await
        .map_err(|err| PersistenceError::Io(std::io::Error::other(err.to_string())))??;
    tracing::debug!(sessions = count, "snapshot written");
    Ok(count)
}

fn spawn_snapshot_writer(inner: &Arc<RegistryInner>) {
    let weak = Arc::downgrade(inner);
    let requests = inner.services.snapshots.clone();
    let shutdown = inner.shutdown.clone();
    inner.runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = requests.requested() => {}
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if let Err(err) = persist(&inner).await {
                tracing::warn!(error = %err, "snapshot write failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::{CacheLimits, CacheStore};
    use crate::events::EventBus;
    use crate::persistence::{SessionSnapshot, SnapshotRequest};
    use crate::player::PlayerSettings;
    use crate::resolver::WorkerPool;
    use crate::sink::PlaybackEnd;
    use crate::test_support::{FakeConnector, FakeResolver, FakeSink};
    use crate::track::track;
    use jukebox_types::CloseReason;
    use tokio::sync::broadcast;

    struct Fixture {
        dir: tempfile::TempDir,
        registry: SessionRegistry,
        resolver: Arc<FakeResolver>,
        connector: Arc<FakeConnector>,
        events: broadcast::Receiver<JukeboxEvent>,
    }

    fn fixture_with(settings: PlayerSettings, make_sink: fn() -> FakeSink) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fixture_in(dir, settings, make_sink)
    }

    fn fixture_in(
        dir: tempfile::TempDir,
        settings: PlayerSettings,
        make_sink: fn() -> FakeSink,
    ) -> Fixture {
        let cache = Arc::new(
            CacheStore::new(
                dir.path().to_path_buf(),
                CacheLimits {
                    budget_bytes: 1_000_000,
                    download_margin_bytes: 0,
                },
            )
            .unwrap(),
        );
        let resolver = Arc::new(FakeResolver::new());
        let connector = Arc::new(FakeConnector::new(make_sink));
        let bus = EventBus::new();
        let events = bus.subscribe();
        let services = PlaybackServices {
            resolver: resolver.clone(),
            cache,
            pool: WorkerPool::new(4),
            events: bus,
            snapshots: SnapshotRequest::new(),
            settings,
        };
        let registry = SessionRegistry::new(
            services,
            connector.clone(),
            SnapshotStore::new(dir.path()),
        );
        Fixture {
            dir,
            registry,
            resolver,
            connector,
            events,
        }
    }

    fn fixture(make_sink: fn() -> FakeSink) -> Fixture {
        fixture_with(PlayerSettings::default(), make_sink)
    }

    fn request(query: &str) -> EnqueueRequest {
        EnqueueRequest {
            query: query.to_string(),
            requested_by: "ana".to_string(),
            voice_target: Some("voice-1".to_string()),
            text_target: Some("text-1".to_string()),
            deferred: false,
        }
    }

    async fn next_event(
        events: &mut broadcast::Receiver<JukeboxEvent>,
        name: &str,
    ) -> JukeboxEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.name() == name {
                return event;
            }
        }
    }

    fn upcoming_ids(queue: &QueueResponse) -> Vec<String> {
        queue.upcoming.iter().map(|track| track.id.clone()).collect()
    }

    #[tokio::test]
    async fn enqueue_without_voice_target_is_not_connected() {
        let f = fixture(FakeSink::manual);
        let mut req = request("id:a:120");
        req.voice_target = None;
        let err = f.registry.enqueue("g1", req).await.unwrap_err();
        assert!(matches!(err, JukeboxError::NotConnected));
        assert!(f.registry.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn duration_gate_keeps_long_tracks_out() {
        let mut f = fixture(FakeSink::manual);
        f.resolver.add("A", track("a", 120));
        f.resolver.add("B", track("b", 700));
        f.resolver.add("C", track("c", 90));
        f.resolver.add("D", track("d", 60));

        // D occupies the sink so A and C stay queued.
        f.registry.enqueue("g1", request("D")).await.unwrap();
        next_event(&mut f.events, "track_started").await;

        let a = f.registry.enqueue("g1", request("A")).await.unwrap();
        let b = f.registry.enqueue("g1", request("B")).await.unwrap();
        let c = f.registry.enqueue("g1", request("C")).await.unwrap();

        assert!(matches!(a, EnqueueResponse::Queued { position: 1, .. }));
        assert_eq!(
            b,
            EnqueueResponse::RejectedTooLong {
                title: "Track b".to_string(),
                duration_secs: 700,
                max_duration_secs: 600,
            }
        );
        assert!(matches!(c, EnqueueResponse::Queued { position: 2, .. }));

        let queue = f.registry.list_queue("g1").await;
        assert_eq!(upcoming_ids(&queue), vec!["a", "c"]);
        assert_eq!(queue.now_playing.map(|t| t.id), Some("d".to_string()));

        let JukeboxEvent::TrackRejected { title, text_target, .. } =
            next_event(&mut f.events, "track_rejected").await
        else {
            unreachable!();
        };
        assert_eq!(title, "Track b");
        assert_eq!(text_target, "text-1");
    }

    #[tokio::test]
    async fn list_queue_preserves_enqueue_order() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:now:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        for id in ["q1", "q2", "q3", "q4"] {
            f.registry
                .enqueue("g1", request(&format!("id:{id}:60")))
                .await
                .unwrap();
        }
        let queue = f.registry.list_queue("g1").await;
        assert_eq!(upcoming_ids(&queue), vec!["q1", "q2", "q3", "q4"]);
        assert!(matches!(
            queue.player_state.as_deref(),
            Some("playing" | "waiting")
        ));
        assert_eq!(f.registry.list_queue("g2").await.player_state, None);
    }

    #[tokio::test]
    async fn one_session_per_group() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        f.registry.enqueue("g1", request("id:b:60")).await.unwrap();
        f.registry.enqueue("g2", request("id:c:60")).await.unwrap();
        assert_eq!(f.registry.session_ids().await, vec!["g1", "g2"]);
        assert_eq!(f.connector.connects().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_sessions_share_one_download() {
        let mut f = fixture(FakeSink::manual);
        f.resolver.set_download_delay(Duration::from_millis(100));
        let sessions = ["g1", "g2", "g3", "g4"];

        let enqueues: Vec<_> = sessions
            .iter()
            .map(|&id| {
                let registry = f.registry.clone();
                tokio::spawn(async move { registry.enqueue(id, request("id:shared:60")).await })
            })
            .collect();
        for enqueue in enqueues {
            enqueue.await.unwrap().unwrap();
        }

        let mut hits = 0;
        for _ in sessions {
            let JukeboxEvent::TrackStarted { track, cache_hit, .. } =
                next_event(&mut f.events, "track_started").await
            else {
                unreachable!();
            };
            assert_eq!(track.id, "shared");
            if cache_hit {
                hits += 1;
            }
        }
        assert_eq!(f.resolver.download_count("shared"), 1);
        assert_eq!(hits, sessions.len() - 1);
        for id in sessions {
            let sink = f.connector.sink(id).unwrap();
            assert!(matches!(
                &sink.plays()[0].0,
                crate::sink::MediaSource::File(path) if path.ends_with("shared.opus")
            ));
        }
    }

    #[tokio::test]
    async fn skip_advances_to_next_track() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        f.registry.enqueue("g1", request("id:b:60")).await.unwrap();

        let skipped = f.registry.skip("g1").await;
        assert!(matches!(skipped, SkipResponse::Skipped { ref track } if track.id == "a"));

        let JukeboxEvent::TrackEnded { track_id, reason, .. } =
            next_event(&mut f.events, "track_ended").await
        else {
            unreachable!();
        };
        assert_eq!(track_id, "a");
        assert_eq!(reason, jukebox_types::PlaybackEndReason::Stopped);
        let JukeboxEvent::TrackStarted { track, .. } =
            next_event(&mut f.events, "track_started").await
        else {
            unreachable!();
        };
        assert_eq!(track.id, "b");
    }

    #[tokio::test]
    async fn skip_without_session_is_nothing_playing() {
        let f = fixture(FakeSink::manual);
        assert_eq!(f.registry.skip("nope").await, SkipResponse::NothingPlaying);
    }

    #[tokio::test]
    async fn stop_tears_down_session() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        f.registry.enqueue("g1", request("id:b:60")).await.unwrap();

        assert_eq!(f.registry.stop("g1").await, StopResponse::Stopped);

        assert!(f.registry.session_ids().await.is_empty());
        assert_eq!(f.connector.disconnects(), vec!["g1".to_string()]);
        assert!(f.connector.sink("g1").unwrap().stop_count() >= 1);
        let JukeboxEvent::SessionClosed { reason, .. } =
            next_event(&mut f.events, "session_closed").await
        else {
            unreachable!();
        };
        assert_eq!(reason, CloseReason::Stopped);
        assert_eq!(f.registry.stop("g1").await, StopResponse::NotConnected);
    }

    #[tokio::test]
    async fn enqueue_during_stop_sees_closed_session() {
        let mut f = fixture(FakeSink::manual);
        f.connector.set_disconnect_delay(Duration::from_millis(300));
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;

        let registry = f.registry.clone();
        let stopping = tokio::spawn(async move { registry.stop("g1").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = f.registry.enqueue("g1", request("id:b:60")).await.unwrap_err();
        assert!(matches!(err, JukeboxError::SessionClosed(ref id) if id == "g1"));
        assert_eq!(f.registry.stop("g1").await, StopResponse::Stopped);
        assert_eq!(stopping.await.unwrap(), StopResponse::Stopped);
        assert!(f.registry.session_ids().await.is_empty());
        assert_eq!(f.connector.connects().len(), 1);
        assert_eq!(f.connector.disconnects(), vec!["g1".to_string()]);

        // Once released, the id is free for a new session.
        f.registry.enqueue("g1", request("id:c:60")).await.unwrap();
        assert_eq!(f.connector.connects().len(), 2);
        assert_eq!(f.connector.disconnects(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn stale_release_leaves_newer_session_connected() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        let generation = f.registry.inner.sessions.lock().await["g1"].generation;

        release_session(
            &f.registry.inner.sessions,
            f.connector.as_ref(),
            "g1",
            generation + 1,
        )
        .await;

        assert_eq!(f.registry.session_ids().await, vec!["g1"]);
        assert!(f.connector.disconnects().is_empty());
    }

    #[tokio::test]
    async fn slow_connect_does_not_block_other_sessions() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("fast", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        f.connector.delay_connect("slow", Duration::from_millis(500));

        let registry = f.registry.clone();
        let slow = tokio::spawn(async move { registry.enqueue("slow", request("id:b:60")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let quick = Duration::from_millis(200);
        let skipped = tokio::time::timeout(quick, f.registry.skip("fast"))
            .await
            .expect("skip waited on another session's connect");
        assert!(matches!(skipped, SkipResponse::Skipped { .. }));
        tokio::time::timeout(quick, f.registry.list_queue("fast"))
            .await
            .expect("listing waited on another session's connect");
        assert!(!slow.is_finished());

        slow.await.unwrap().unwrap();
        assert_eq!(f.registry.session_ids().await, vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn concurrent_creators_share_one_connect() {
        let mut f = fixture(FakeSink::manual);
        f.connector.delay_connect("g1", Duration::from_millis(100));

        let creators: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|&id| {
                let registry = f.registry.clone();
                tokio::spawn(async move {
                    registry.enqueue("g1", request(&format!("id:{id}:60"))).await
                })
            })
            .collect();
        for creator in creators {
            creator.await.unwrap().unwrap();
        }

        next_event(&mut f.events, "track_started").await;
        assert_eq!(
            f.connector.connects(),
            vec![("g1".to_string(), "voice-1".to_string())]
        );
        let queue = f.registry.list_queue("g1").await;
        assert_eq!(queue.upcoming.len(), 2);
    }

    #[tokio::test]
    async fn failed_shared_download_advances_both_sessions() {
        let mut f = fixture(FakeSink::manual);
        f.resolver.fail_downloads_of("shared");
        f.resolver.set_download_delay(Duration::from_millis(300));

        f.registry.enqueue("g1", request("id:shared:60")).await.unwrap();
        f.registry.enqueue("g1", request("id:next1:60")).await.unwrap();
        f.registry.enqueue("g2", request("id:shared:60")).await.unwrap();
        f.registry.enqueue("g2", request("id:next2:60")).await.unwrap();

        let mut errors: HashMap<String, Vec<String>> = HashMap::new();
        let mut started: HashMap<String, String> = HashMap::new();
        while started.len() < 2 {
            match f.events.recv().await.unwrap() {
                JukeboxEvent::Error {
                    session_id,
                    message,
                    ..
                } => errors.entry(session_id).or_default().push(message),
                JukeboxEvent::TrackStarted {
                    session_id, track, ..
                } => {
                    started.insert(session_id, track.id);
                }
                _ => {}
            }
        }

        assert_eq!(started["g1"], "next1");
        assert_eq!(started["g2"], "next2");
        assert_eq!(errors["g1"].len(), 1);
        assert!(errors["g1"][0].contains("fetch failed"));
        assert_eq!(
            errors["g2"],
            vec![DownloadError::Abandoned("shared".to_string()).to_string()]
        );
        assert_eq!(f.resolver.download_count("shared"), 1);
    }

    #[tokio::test]
    async fn pause_and_resume_follow_sink_state() {
        let mut f = fixture(FakeSink::manual);
        assert_eq!(
            f.registry.pause("g1").await.unwrap(),
            PauseResponse::NothingPlaying
        );
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;

        assert_eq!(
            f.registry.resume("g1").await.unwrap(),
            ResumeResponse::NotPaused
        );
        assert_eq!(f.registry.pause("g1").await.unwrap(), PauseResponse::Paused);
        assert_eq!(
            f.registry.pause("g1").await.unwrap(),
            PauseResponse::AlreadyPaused
        );
        assert_eq!(
            f.registry.resume("g1").await.unwrap(),
            ResumeResponse::Resumed
        );

        f.connector
            .sink("g1")
            .unwrap()
            .finish_current(PlaybackEnd::eof());
        next_event(&mut f.events, "track_ended").await;
        assert_eq!(
            f.registry.resume("g1").await.unwrap(),
            ResumeResponse::NothingPlaying
        );
    }

    #[tokio::test]
    async fn deferred_enqueue_queues_raw_query() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;

        let response = f
            .registry
            .enqueue_deferred("g1", "some song", "bo", None)
            .await
            .unwrap();
        let EnqueueResponse::Queued { position, track } = response else {
            panic!("expected queued");
        };
        assert_eq!(position, 1);
        assert_eq!(track.title, "some song");
        assert_eq!(track.requested_by, "bo");
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_playback_error() {
        let f = fixture(FakeSink::manual);
        f.connector.refuse_connections();
        let err = f.registry.enqueue("g1", request("id:a:60")).await.unwrap_err();
        assert!(matches!(err, JukeboxError::PlaybackStart(_)));
        assert!(f.registry.session_ids().await.is_empty());
    }

    #[tokio::test]
    async fn resolve_failure_is_returned_to_caller() {
        let f = fixture(FakeSink::manual);
        let err = f.registry.enqueue("g1", request("unknown")).await.unwrap_err();
        assert!(matches!(err, JukeboxError::Resolve(ResolveError::NotFound(_))));
    }

    #[tokio::test]
    async fn snapshot_and_restore_round_trip() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:c:200")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        f.registry.enqueue("g1", request("id:b:60")).await.unwrap();

        assert_eq!(f.registry.persist_now().await.unwrap(), 1);
        let saved = SnapshotStore::new(f.dir.path()).load().unwrap();
        let ids: Vec<String> = saved[0]
            .queue
            .iter()
            .filter_map(|item| item.as_track().map(|t| t.id.clone()))
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        // Simulate a restart against the same cache root.
        let Fixture { dir, registry, .. } = f;
        drop(registry);
        let mut restarted = fixture_in(dir, PlayerSettings::default(), FakeSink::manual);
        assert_eq!(restarted.registry.restore().await, 1);

        let JukeboxEvent::TrackStarted {
            track,
            resumed,
            resume_position_secs,
            ..
        } = next_event(&mut restarted.events, "track_started").await
        else {
            unreachable!();
        };
        assert_eq!(track.id, "c");
        assert!(resumed);
        assert_eq!(resume_position_secs, Some(0));
        let queue = restarted.registry.list_queue("g1").await;
        assert_eq!(upcoming_ids(&queue), vec!["a", "b"]);
        assert_eq!(
            restarted.connector.connects(),
            vec![("g1".to_string(), "voice-1".to_string())]
        );
    }

    #[tokio::test]
    async fn restore_with_explicit_snapshot_marks_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        SnapshotStore::new(dir.path())
            .save(&[SessionSnapshot {
                session_id: "g9".to_string(),
                voice_target: "voice-9".to_string(),
                text_target: "text-9".to_string(),
                queue: vec![
                    QueueItem::Resolved(track("c", 200)),
                    QueueItem::Resolved(track("a", 60)),
                    QueueItem::Resolved(track("b", 60)),
                ],
                elapsed_secs: Some(42),
                volume: 0.8,
            }])
            .unwrap();
        let mut f = fixture_in(dir, PlayerSettings::default(), FakeSink::manual);
        assert_eq!(f.registry.restore().await, 1);

        let JukeboxEvent::TrackStarted {
            track,
            text_target,
            resumed,
            resume_position_secs,
            ..
        } = next_event(&mut f.events, "track_started").await
        else {
            unreachable!();
        };
        assert_eq!(track.id, "c");
        assert_eq!(text_target, "text-9");
        assert!(resumed);
        assert_eq!(resume_position_secs, Some(42));
        let sink = f.connector.sink("g9").unwrap();
        assert!((sink.plays()[0].1 - 0.8).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn corrupt_snapshot_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.snapshot"), b"garbage").unwrap();
        let f = fixture_in(dir, PlayerSettings::default(), FakeSink::manual);
        assert_eq!(f.registry.restore().await, 0);
        assert!(f.registry.session_ids().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_is_destroyed_and_released() {
        let settings = PlayerSettings {
            cache_enabled: false,
            ..PlayerSettings::default()
        };
        let mut f = fixture_with(settings, FakeSink::auto_complete);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_ended").await;

        let JukeboxEvent::SessionClosed { reason, .. } =
            next_event(&mut f.events, "session_closed").await
        else {
            unreachable!();
        };
        assert_eq!(reason, CloseReason::Idle);
        assert!(f.registry.session_ids().await.is_empty());
        assert_eq!(f.connector.disconnects(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn cache_stats_reports_downloads() {
        let mut f = fixture(FakeSink::manual);
        f.registry.enqueue("g1", request("id:a:60")).await.unwrap();
        next_event(&mut f.events, "track_started").await;
        let stats = f.registry.cache_stats().await.unwrap();
        assert_eq!(stats.track_count, 1);
        assert_eq!(stats.total_bytes, crate::test_support::FAKE_MEDIA_BYTES as u64);
        assert_eq!(stats.largest_entries[0].track_id, "a");
    }
}
