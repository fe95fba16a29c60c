//! Cache API handlers.

use actix_web::{get, web, HttpResponse, Responder};
use jukebox_types::CacheStatsResponse;

use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/cache/stats",
    responses(
        (status = 200, description = "Cache usage", body = CacheStatsResponse),
        (status = 500, description = "Cache directory unreadable")
    )
)]
#[get("/cache/stats")]
/// Report cache usage and the largest entries.
pub async fn cache_stats(state: web::Data<AppState>) -> impl Responder {
    match state.registry.cache_stats().await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(err) => err.into_response(),
    }
}
