//! Per-session playback loop.
//!
//! One task per session drives the state machine:
//! `Idle -> Resolving -> CacheLookup -> Downloading -> Playing -> Waiting`, back
//! to `Idle`, until the idle window passes or the session is stopped. Every
//! per-track failure is reported once and the loop moves on.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jukebox_types::{CloseReason, JukeboxEvent};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache_store::{CacheLease, CacheStore};
use crate::download_dedup::{DownloadClaim, DownloadOutcome, DownloadTicket};
use crate::error::{DownloadError, JukeboxError, ValidationError};
use crate::events::EventBus;
use crate::persistence::SnapshotRequest;
use crate::queue::{Dequeued, SessionQueue};
use crate::resolver::{PartialDownload, TrackResolver, WorkerPool};
use crate::sink::{AudioSink, MediaSource, PlaybackCompletion, PlaybackEnd};
use crate::status_store::{PlayerState, StatusStore};
use crate::track::{QueueItem, SessionTargets, Track, validate_duration};

/// Tunables shared by every session.
#[derive(Clone, Debug)]
pub struct PlayerSettings {
    pub max_duration_secs: u64,
    pub idle_timeout: Duration,
    pub cache_enabled: bool,
    pub prefetch: bool,
    pub default_volume: f32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            max_duration_secs: 600,
            idle_timeout: Duration::from_secs(300),
            cache_enabled: true,
            prefetch: true,
            default_volume: 0.5,
        }
    }
}

/// Collaborators injected into every session.
#[derive(Clone)]
pub struct PlaybackServices {
    pub resolver: Arc<dyn TrackResolver>,
    pub cache: Arc<CacheStore>,
    pub pool: WorkerPool,
    pub events: EventBus,
    pub snapshots: SnapshotRequest,
    pub settings: PlayerSettings,
}

/// Narrow capability used by a finished session to leave the registry.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    /// Release the voice connection and drop the registry entry for
    /// `session_id`, if it still belongs to `generation`.
    async fn release(&self, session_id: &str, generation: u64);
}

/// Session-owned state handed to the player task.
pub struct PlayerContext {
    pub session_id: String,
    pub generation: u64,
    pub targets: SessionTargets,
    pub queue: Arc<SessionQueue>,
    pub sink: Arc<dyn AudioSink>,
    pub status: StatusStore,
    pub volume: f32,
    pub cancel: CancellationToken,
}

enum PreparedMedia {
    Cached { lease: CacheLease, cache_hit: bool },
    Stream(String),
}

pub struct SessionPlayer {
    ctx: PlayerContext,
    services: PlaybackServices,
    teardown: Arc<dyn SessionTeardown>,
    prefetch: JoinSet<()>,
}

impl SessionPlayer {
    pub fn new(
        ctx: PlayerContext,
        services: PlaybackServices,
        teardown: Arc<dyn SessionTeardown>,
    ) -> Self {
        Self {
            ctx,
            services,
            teardown,
            prefetch: JoinSet::new(),
        }
    }

    fn set_state(&self, state: PlayerState) {
        tracing::debug!(session_id = %self.ctx.session_id, state = ?state, "player state");
        self.ctx.status.set_state(state);
    }

    /// Drive the session until it is destroyed.
    pub async fn run(mut self) {
        tracing::info!(session_id = %self.ctx.session_id, "session started");
        let reason = loop {
            self.set_state(PlayerState::Idle);
            match self
                .ctx
                .queue
                .dequeue_or_timeout(self.services.settings.idle_timeout)
                .await
            {
                Dequeued::Item(item) => self.play_item(item).await,
                Dequeued::TimedOut => {
                    if self.ctx.queue.close_if_empty() {
                        break CloseReason::Idle;
                    }
                }
                Dequeued::Cancelled => break CloseReason::Stopped,
            }
        };
        self.destroy(reason).await;
    }

    /// Await `fut` unless the session is cancelled first.
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn play_item(&mut self, item: QueueItem) {
        let track = match item {
            QueueItem::Resolved(track) => track,
            QueueItem::Query {
                query,
                requested_by,
            } => {
                self.set_state(PlayerState::Resolving);
                let resolver = self.services.resolver.clone();
                let job = self.services.pool.run(move || resolver.resolve(&query));
                let Some(result) = self.cancellable(job).await else {
                    return;
                };
                match result.and_then(|resolved| resolved.map_err(JukeboxError::from)) {
                    Ok(track) => track.with_requester(requested_by),
                    Err(err) => {
                        self.report(&err);
                        return;
                    }
                }
            }
        };

        if let Err(err) = validate_duration(&track, self.services.settings.max_duration_secs) {
            self.reject(err);
            return;
        }

        let media = match self.prepare_media(&track).await {
            Ok(media) => media,
            Err(err) => {
                self.report(&err);
                return;
            }
        };
        self.play_and_wait(track, media).await;
    }

    async fn prepare_media(&self, track: &Track) -> Result<PreparedMedia, JukeboxError> {
        if !self.services.settings.cache_enabled {
            return Ok(PreparedMedia::Stream(track.stream_ref.clone()));
        }

        loop {
            self.set_state(PlayerState::CacheLookup);
            let cache = self.services.cache.clone();
            let track_id = track.id.clone();
            let lookup = cache_io(&self.services.pool, move || cache.open_for_playback(&track_id));
            let Some(lookup) = self.cancellable(lookup).await else {
                return Err(self.closed());
            };
            if let Some(lease) = lookup? {
                tracing::debug!(session_id = %self.ctx.session_id, track_id = %track.id, "cache hit");
                return Ok(PreparedMedia::Cached {
                    lease,
                    cache_hit: true,
                });
            }

            self.set_state(PlayerState::Downloading);
            match self.services.cache.begin_download(&track.id) {
                DownloadClaim::InFlight(waiter) => {
                    tracing::info!(
                        session_id = %self.ctx.session_id,
                        track_id = %track.id,
                        "joining in-flight download"
                    );
                    let Some(outcome) = self.cancellable(waiter.wait()).await else {
                        return Err(self.closed());
                    };
                    if outcome != DownloadOutcome::Committed {
                        return Err(DownloadError::Abandoned(track.id.clone()).into());
                    }
                    // Committed elsewhere; the next lookup is a hit.
                }
                DownloadClaim::Ticket(ticket) => {
                    let job = fetch_with_ticket(&self.services, track.clone(), ticket);
                    let Some(result) = self.cancellable(job).await else {
                        return Err(self.closed());
                    };
                    let (lease, cache_hit) = result?;
                    return Ok(PreparedMedia::Cached { lease, cache_hit });
                }
            }
        }
    }

    async fn play_and_wait(&mut self, track: Track, media: PreparedMedia) {
        let (source, lease, cache_hit) = match media {
            PreparedMedia::Cached { lease, cache_hit } => (
                MediaSource::File(lease.path().to_path_buf()),
                Some(lease),
                cache_hit,
            ),
            PreparedMedia::Stream(url) => (MediaSource::Stream(url), None, false),
        };
        let track = match &lease {
            Some(lease) => track.with_cached_path(lease.path().to_path_buf()),
            None => track,
        };

        self.set_state(PlayerState::Playing);
        let (completion, done) = PlaybackCompletion::channel();
        if let Err(err) = self.ctx.sink.play(source, self.ctx.volume, completion) {
            self.report(&JukeboxError::from(err));
            return;
        }
        self.ctx.status.on_play(track.clone(), cache_hit);
        let resume = self.ctx.status.take_resume();
        tracing::info!(
            session_id = %self.ctx.session_id,
            track_id = %track.id,
            cache_hit,
            resumed = resume.is_some(),
            "now playing"
        );
        self.services.events.publish(JukeboxEvent::TrackStarted {
            session_id: self.ctx.session_id.clone(),
            text_target: self.ctx.targets.text.clone(),
            track: track.summary(),
            cache_hit,
            resumed: resume.is_some(),
            resume_position_secs: resume.flatten(),
        });
        self.services.snapshots.request();
        self.schedule_prefetch();

        self.set_state(PlayerState::Waiting);
        let end = tokio::select! {
            end = done.wait() => end,
            _ = self.ctx.cancel.cancelled() => {
                self.ctx.sink.stop();
                PlaybackEnd::stopped()
            }
        };
        drop(lease);
        self.ctx.status.on_track_end();

        if let Some(message) = &end.error {
            tracing::warn!(
                session_id = %self.ctx.session_id,
                track_id = %track.id,
                error = %message,
                "playback failed"
            );
            self.services.events.publish(JukeboxEvent::Error {
                session_id: self.ctx.session_id.clone(),
                text_target: self.ctx.targets.text.clone(),
                message: message.clone(),
            });
        }
        self.services.events.publish(JukeboxEvent::TrackEnded {
            session_id: self.ctx.session_id.clone(),
            text_target: self.ctx.targets.text.clone(),
            track_id: track.id,
            reason: end.reason,
        });
        self.services.snapshots.request();
    }

    /// Start a background download of the next queued track, if it is not cached.
    fn schedule_prefetch(&mut self) {
        let settings = &self.services.settings;
        if !settings.prefetch || !settings.cache_enabled {
            return;
        }
        while self.prefetch.try_join_next().is_some() {}

        let Some(QueueItem::Resolved(next)) = self.ctx.queue.peek_front() else {
            return;
        };
        let services = self.services.clone();
        let session_id = self.ctx.session_id.clone();
        self.prefetch.spawn(async move {
            let cache = services.cache.clone();
            let track_id = next.id.clone();
            match cache_io(&services.pool, move || cache.lookup(&track_id)).await {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(session_id = %session_id, error = %err, "prefetch lookup failed");
                    return;
                }
            }
            let DownloadClaim::Ticket(ticket) = services.cache.begin_download(&next.id) else {
                return;
            };
            tracing::debug!(session_id = %session_id, track_id = %next.id, "prefetching");
            if let Err(err) = fetch_with_ticket(&services, next, ticket).await {
                tracing::warn!(session_id = %session_id, error = %err, "prefetch failed");
            }
        });
    }

    fn closed(&self) -> JukeboxError {
        JukeboxError::SessionClosed(self.ctx.session_id.clone())
    }

    fn reject(&self, err: ValidationError) {
        let ValidationError::TooLong {
            title,
            duration_secs,
            max_duration_secs,
        } = err;
        tracing::info!(
            session_id = %self.ctx.session_id,
            title = %title,
            duration_secs,
            "track rejected"
        );
        self.services.events.publish(JukeboxEvent::TrackRejected {
            session_id: self.ctx.session_id.clone(),
            text_target: self.ctx.targets.text.clone(),
            title,
            duration_secs,
            max_duration_secs,
        });
    }

    /// Report a per-track failure once. Teardown is not a failure.
    fn report(&self, err: &JukeboxError) {
        if err.is_session_closed() {
            return;
        }
        tracing::warn!(session_id = %self.ctx.session_id, error = %err, "track failed");
        self.services.events.publish(JukeboxEvent::Error {
            session_id: self.ctx.session_id.clone(),
            text_target: self.ctx.targets.text.clone(),
            message: err.to_string(),
        });
    }

    async fn destroy(mut self, reason: CloseReason) {
        self.prefetch.shutdown().await;
        self.ctx.queue.close();
        self.ctx.sink.stop();
        self.teardown
            .release(&self.ctx.session_id, self.ctx.generation)
            .await;
        tracing::info!(session_id = %self.ctx.session_id, reason = ?reason, "session closed");
        self.services.events.publish(JukeboxEvent::SessionClosed {
            session_id: self.ctx.session_id.clone(),
            reason,
        });
        self.services.snapshots.request();
        self.set_state(PlayerState::Destroyed);
    }
}

/// Run short cache filesystem work on the worker pool.
async fn cache_io<T, F>(pool: &WorkerPool, job: F) -> Result<T, JukeboxError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    pool.run(job)
        .await?
        .map_err(|err| DownloadError::Io(err).into())
}

/// Download `track` on the worker pool, commit it and pin it.
///
/// The ticket travels with the blocking job, so waiters are released even if
/// the requesting session goes away mid-download.
async fn fetch_with_ticket(
    services: &PlaybackServices,
    track: Track,
    ticket: DownloadTicket,
) -> Result<(CacheLease, bool), JukeboxError> {
    let cache = services.cache.clone();
    let resolver = services.resolver.clone();
    let result = services
        .pool
        .run(move || {
            let result = fetch_into_cache(&cache, resolver.as_ref(), &track);
            ticket.complete(result.is_ok());
            result
        })
        .await?;
    Ok(result?)
}

fn fetch_into_cache(
    cache: &CacheStore,
    resolver: &dyn TrackResolver,
    track: &Track,
) -> Result<(CacheLease, bool), DownloadError> {
    // Someone may have committed between our lookup and the claim.
    if let Some(lease) = cache.open_for_playback(&track.id)? {
        return Ok((lease, true));
    }
    if let Err(err) = cache.reserve_for_download() {
        tracing::warn!(track_id = %track.id, error = %err, "pre-download eviction failed");
    }

    let partial = PartialDownload::new(cache.temp_path(&track.id));
    let media = resolver.download(track, partial.path())?;
    let lease = cache.commit(track, &media)?;
    partial.keep();
    tracing::info!(track_id = %track.id, size_bytes = media.size_bytes, "downloaded");

    if let Err(err) = cache.evict_to_budget(cache.limits().budget_bytes) {
        tracing::warn!(track_id = %track.id, error = %err, "post-commit eviction failed");
    }
    Ok((lease, false))
}
