//! HTTP API handlers.
//!
//! Defines the Actix routes for session control, cache statistics, and the
//! notification stream.

pub mod cache;
pub mod health;
pub mod sessions;
pub mod streams;

use actix_web::HttpResponse;
use actix_web::web;

use crate::error::JukeboxError;

pub use cache::cache_stats;
pub use sessions::{
    queue_add,
    queue_list,
    session_pause,
    session_resume,
    session_skip,
    session_stop,
    sessions_list,
};
pub use streams::events_stream;

/// Register every route on an Actix app or scope.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health::health)
        .service(sessions_list)
        .service(queue_add)
        .service(queue_list)
        .service(session_skip)
        .service(session_stop)
        .service(session_pause)
        .service(session_resume)
        .service(cache_stats)
        .service(events_stream);
}

impl JukeboxError {
    /// Map a core error onto an HTTP response.
    pub fn into_response(self) -> HttpResponse {
        let message = self.to_string();
        match self {
            JukeboxError::Validation(_) => HttpResponse::UnprocessableEntity().body(message),
            JukeboxError::NotConnected | JukeboxError::SessionClosed(_) => {
                HttpResponse::Conflict().body(message)
            }
            JukeboxError::Resolve(_) | JukeboxError::PlaybackStart(_) => {
                HttpResponse::BadGateway().body(message)
            }
            JukeboxError::Download(_)
            | JukeboxError::Persistence(_)
            | JukeboxError::WorkerPool(_) => {
                tracing::warn!(error = %message, "request failed");
                HttpResponse::InternalServerError().body(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use jukebox_types::{
        CacheStatsResponse, EnqueueRequest, EnqueueResponse, QueueResponse, SessionsResponse,
        SkipResponse, StopResponse,
    };

    use crate::cache_store::{CacheLimits, CacheStore};
    use crate::events::EventBus;
    use crate::persistence::{SnapshotRequest, SnapshotStore};
    use crate::player::{PlaybackServices, PlayerSettings};
    use crate::resolver::WorkerPool;
    use crate::session_registry::SessionRegistry;
    use crate::state::AppState;
    use crate::test_support::{FakeConnector, FakeResolver, FakeSink};
    use crate::track::track;

    fn make_state(dir: &tempfile::TempDir) -> (actix_web::web::Data<AppState>, Arc<FakeResolver>) {
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
        let services = PlaybackServices {
            resolver: resolver.clone(),
            cache,
            pool: WorkerPool::new(2),
            events: EventBus::new(),
            snapshots: SnapshotRequest::new(),
            settings: PlayerSettings::default(),
        };
        let registry = SessionRegistry::new(
            services,
            Arc::new(FakeConnector::new(FakeSink::manual)),
            SnapshotStore::new(dir.path()),
        );
        (actix_web::web::Data::new(AppState::new(registry)), resolver)
    }

    fn enqueue(query: &str, voice: Option<&str>) -> EnqueueRequest {
        EnqueueRequest {
            query: query.to_string(),
            requested_by: "ana".to_string(),
            voice_target: voice.map(str::to_string),
            text_target: None,
            deferred: false,
        }
    }

    #[actix_web::test]
    async fn queue_add_and_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (state, resolver) = make_state(&dir);
        resolver.add("lofi", track("a", 120));
        resolver.add("more lofi", track("b", 120));
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let mut events = state.events.subscribe();

        let req = test::TestRequest::post()
            .uri("/sessions/g1/queue")
            .set_json(enqueue("lofi", Some("voice-1")))
            .to_request();
        let resp: EnqueueResponse = test::call_and_read_body_json(&app, req).await;
        assert!(matches!(resp, EnqueueResponse::Queued { position: 1, .. }));
        while events.recv().await.unwrap().name() != "track_started" {}

        let req = test::TestRequest::post()
            .uri("/sessions/g1/queue")
            .set_json(enqueue("more lofi", None))
            .to_request();
        let resp: EnqueueResponse = test::call_and_read_body_json(&app, req).await;
        assert!(matches!(resp, EnqueueResponse::Queued { position: 1, .. }));

        let req = test::TestRequest::get().uri("/sessions/g1/queue").to_request();
        let resp: QueueResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.now_playing.map(|t| t.id), Some("a".to_string()));
        let upcoming: Vec<String> = resp.upcoming.into_iter().map(|t| t.id).collect();
        assert_eq!(upcoming, vec!["b"]);

        let req = test::TestRequest::get().uri("/sessions").to_request();
        let resp: SessionsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.sessions, vec!["g1"]);
    }

    #[actix_web::test]
    async fn too_long_track_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let (state, resolver) = make_state(&dir);
        resolver.add("concert", track("long", 3600));
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let req = test::TestRequest::post()
            .uri("/sessions/g1/queue")
            .set_json(enqueue("concert", Some("voice-1")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: EnqueueResponse = test::read_body_json(resp).await;
        assert!(matches!(
            body,
            EnqueueResponse::RejectedTooLong { duration_secs: 3600, .. }
        ));
    }

    #[actix_web::test]
    async fn missing_voice_target_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = make_state(&dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let req = test::TestRequest::post()
            .uri("/sessions/g1/queue")
            .set_json(enqueue("id:a:60", None))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn resolve_failure_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = make_state(&dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let req = test::TestRequest::post()
            .uri("/sessions/g1/queue")
            .set_json(enqueue("nothing matches", Some("voice-1")))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[actix_web::test]
    async fn control_routes_on_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = make_state(&dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let req = test::TestRequest::post().uri("/sessions/g1/skip").to_request();
        let resp: SkipResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, SkipResponse::NothingPlaying);

        let req = test::TestRequest::post().uri("/sessions/g1/stop").to_request();
        let resp: StopResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp, StopResponse::NotConnected);
    }

    #[actix_web::test]
    async fn cache_stats_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = make_state(&dir);
        let app = test::init_service(App::new().app_data(state.clone()).configure(super::configure))
            .await;

        let req = test::TestRequest::get().uri("/cache/stats").to_request();
        let resp: CacheStatsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.track_count, 0);
        assert_eq!(resp.budget_bytes, 1_000_000);

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["status"], "ok");
        assert_eq!(resp["version"], env!("CARGO_PKG_VERSION"));
    }
}
