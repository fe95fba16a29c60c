use utoipa::OpenApi;

use crate::api;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health,
        api::sessions::sessions_list,
        api::sessions::queue_add,
        api::sessions::queue_list,
        api::sessions::session_skip,
        api::sessions::session_stop,
        api::sessions::session_pause,
        api::sessions::session_resume,
        api::cache::cache_stats,
        api::streams::events_stream,
    ),
    components(
        schemas(
            jukebox_types::TrackSummary,
            jukebox_types::EnqueueRequest,
            jukebox_types::EnqueueResponse,
            jukebox_types::SkipResponse,
            jukebox_types::StopResponse,
            jukebox_types::PauseResponse,
            jukebox_types::ResumeResponse,
            jukebox_types::QueueResponse,
            jukebox_types::SessionsResponse,
            jukebox_types::CacheEntrySummary,
            jukebox_types::CacheStatsResponse,
            jukebox_types::JukeboxEvent,
            jukebox_types::PlaybackEndReason,
            jukebox_types::CloseReason,
            api::health::HealthResponse,
        )
    ),
    tags(
        (name = "jukebox-server", description = "Jukebox session control API")
    )
)]
pub struct ApiDoc;
