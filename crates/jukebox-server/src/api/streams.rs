//! Server-sent event stream of jukebox notifications.

use std::collections::VecDeque;
use std::time::Instant;

use actix_web::{get, web, Error, HttpResponse, Responder};
use actix_web::http::header;
use actix_web::web::Bytes;
use futures_util::{Stream, stream::unfold};
use jukebox_types::JukeboxEvent;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, Interval, MissedTickBehavior};
use utoipa::IntoParams;

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize, IntoParams)]
pub struct EventsQuery {
    /// Only forward events for this session.
    pub session_id: Option<String>,
}

struct EventsStreamState {
    receiver: broadcast::Receiver<JukeboxEvent>,
    session_id: Option<String>,
    interval: Interval,
    pending: VecDeque<Bytes>,
    last_ping: Instant,
}

fn sse_event(event: &str, data: &str) -> Bytes {
    let mut payload = String::new();
    payload.push_str("event: ");
    payload.push_str(event);
    payload.push('\n');
    for line in data.lines() {
        payload.push_str("data: ");
        payload.push_str(line);
        payload.push('\n');
    }
    payload.push('\n');
    Bytes::from(payload)
}

fn push_ping_if_needed(pending: &mut VecDeque<Bytes>, last_ping: &mut Instant) {
    if pending.is_empty() && last_ping.elapsed() >= PING_INTERVAL {
        *last_ping = Instant::now();
        pending.push_back(Bytes::from(": ping\n\n"));
    }
}

fn sse_response<S>(stream: S) -> HttpResponse
where
    S: Stream<Item = Result<Bytes, Error>> + 'static,
{
    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .insert_header((header::CONNECTION, "keep-alive"))
        .streaming(stream)
}

#[utoipa::path(
    get,
    path = "/events/stream",
    params(EventsQuery),
    responses(
        (status = 200, description = "Notification event stream")
    )
)]
#[get("/events/stream")]
/// Stream notification events via server-sent events.
pub async fn events_stream(
    state: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> impl Responder {
    let mut interval = tokio::time::interval(PING_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let stream = unfold(
        EventsStreamState {
            receiver: state.events.subscribe(),
            session_id: query.into_inner().session_id,
            interval,
            pending: VecDeque::new(),
            last_ping: Instant::now(),
        },
        |mut ctx| async move {
            loop {
                if let Some(bytes) = ctx.pending.pop_front() {
                    return Some((Ok::<Bytes, Error>(bytes), ctx));
                }

                tokio::select! {
                    _ = ctx.interval.tick() => {}
                    result = ctx.receiver.recv() => match result {
                        Ok(event) => {
                            let wanted = ctx
                                .session_id
                                .as_deref()
                                .is_none_or(|id| id == event.session_id());
                            if wanted {
                                match serde_json::to_string(&event) {
                                    Ok(json) => ctx.pending.push_back(sse_event(event.name(), &json)),
                                    Err(err) => tracing::warn!(error = %err, "event encode failed"),
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "event stream lagged");
                        }
                        Err(RecvError::Closed) => return None,
                    },
                }

                push_ping_if_needed(&mut ctx.pending, &mut ctx.last_ping);
            }
        },
    );

    sse_response(stream)
}
