//! Session control API handlers.

use actix_web::{get, post, web, HttpResponse, Responder};
use jukebox_types::{
    EnqueueRequest,
    EnqueueResponse,
    PauseResponse,
    QueueResponse,
    ResumeResponse,
    SessionsResponse,
    SkipResponse,
    StopResponse,
};

use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/sessions/{id}/queue",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    request_body = EnqueueRequest,
    responses(
        (status = 200, description = "Track queued", body = EnqueueResponse),
        (status = 409, description = "No voice target or session closing"),
        (status = 422, description = "Track longer than the duration limit", body = EnqueueResponse),
        (status = 502, description = "Resolver or voice connection failed")
    )
)]
#[post("/sessions/{id}/queue")]
/// Resolve a query and append it to the session queue.
pub async fn queue_add(
    state: web::Data<AppState>,
    id: web::Path<String>,
    body: web::Json<EnqueueRequest>,
) -> impl Responder {
    let session_id = id.into_inner();
    match state.registry.enqueue(&session_id, body.into_inner()).await {
        Ok(resp @ EnqueueResponse::Queued { .. }) => HttpResponse::Ok().json(resp),
        Ok(resp @ EnqueueResponse::RejectedTooLong { .. }) => {
            HttpResponse::UnprocessableEntity().json(resp)
        }
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/sessions/{id}/queue",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Current track and upcoming queue", body = QueueResponse)
    )
)]
#[get("/sessions/{id}/queue")]
/// List the current track and upcoming queue.
pub async fn queue_list(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    HttpResponse::Ok().json(state.registry.list_queue(&id).await)
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/skip",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Skip result", body = SkipResponse)
    )
)]
#[post("/sessions/{id}/skip")]
/// Skip the current track.
pub async fn session_skip(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    HttpResponse::Ok().json(state.registry.skip(&id).await)
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/stop",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Stop result", body = StopResponse)
    )
)]
#[post("/sessions/{id}/stop")]
/// Clear the queue and leave voice.
pub async fn session_stop(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    HttpResponse::Ok().json(state.registry.stop(&id).await)
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/pause",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Pause result", body = PauseResponse),
        (status = 502, description = "Audio sink refused")
    )
)]
#[post("/sessions/{id}/pause")]
pub async fn session_pause(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    match state.registry.pause(&id).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/resume",
    params(
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Resume result", body = ResumeResponse),
        (status = 502, description = "Audio sink refused")
    )
)]
#[post("/sessions/{id}/resume")]
pub async fn session_resume(state: web::Data<AppState>, id: web::Path<String>) -> impl Responder {
    match state.registry.resume(&id).await {
        Ok(resp) => HttpResponse::Ok().json(resp),
        Err(err) => err.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsResponse)
    )
)]
#[get("/sessions")]
/// List live session ids.
pub async fn sessions_list(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(SessionsResponse {
        sessions: state.registry.session_ids().await,
    })
}
