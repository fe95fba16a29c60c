use std::io::{self, Read};

use anyhow::{Context, Result};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use jukebox_types::{
    CacheStatsResponse, EnqueueRequest, EnqueueResponse, PauseResponse, QueueResponse,
    ResumeResponse, SessionsResponse, SkipResponse, StopResponse,
};
use serde::de::DeserializeOwned;

/// Blocking client for the jukebox-server HTTP API.
pub(crate) struct ServerApi {
    base: String,
    agent: ureq::Agent,
}

impl ServerApi {
    pub(crate) fn new(server: &str) -> Self {
        // Non-2xx replies carry JSON or a message we want to surface.
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base: server.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn session_url(&self, session_id: &str, action: &str) -> String {
        session_url(&self.base, session_id, action)
    }

    pub(crate) fn enqueue(&self, session_id: &str, req: &EnqueueRequest) -> Result<EnqueueResponse> {
        let url = self.session_url(session_id, "queue");
        let resp = self
            .agent
            .post(&url)
            .send_json(req)
            .context("request /sessions/{id}/queue")?;
        // 422 still carries an `EnqueueResponse`.
        if resp.status().as_u16() == 422 {
            return read_json(resp, "sessions/{id}/queue");
        }
        read_ok_json(resp, "sessions/{id}/queue")
    }

    pub(crate) fn queue(&self, session_id: &str) -> Result<QueueResponse> {
        let url = self.session_url(session_id, "queue");
        let resp = self
            .agent
            .get(&url)
            .call()
            .context("request /sessions/{id}/queue")?;
        read_ok_json(resp, "sessions/{id}/queue")
    }

    pub(crate) fn skip(&self, session_id: &str) -> Result<SkipResponse> {
        self.post_action(session_id, "skip")
    }

    pub(crate) fn stop(&self, session_id: &str) -> Result<StopResponse> {
        self.post_action(session_id, "stop")
    }

    pub(crate) fn pause(&self, session_id: &str) -> Result<PauseResponse> {
        self.post_action(session_id, "pause")
    }

    pub(crate) fn resume(&self, session_id: &str) -> Result<ResumeResponse> {
        self.post_action(session_id, "resume")
    }

    fn post_action<T: DeserializeOwned>(&self, session_id: &str, action: &str) -> Result<T> {
        let url = self.session_url(session_id, action);
        let label = format!("sessions/{{id}}/{action}");
        let resp = self
            .agent
            .post(&url)
            .send_empty()
            .with_context(|| format!("request /{label}"))?;
        read_ok_json(resp, &label)
    }

    pub(crate) fn sessions(&self) -> Result<SessionsResponse> {
        let url = format!("{}/sessions", self.base);
        let resp = self.agent.get(&url).call().context("request /sessions")?;
        read_ok_json(resp, "sessions")
    }

    pub(crate) fn cache_stats(&self) -> Result<CacheStatsResponse> {
        let url = format!("{}/cache/stats", self.base);
        let resp = self
            .agent
            .get(&url)
            .call()
            .context("request /cache/stats")?;
        read_ok_json(resp, "cache/stats")
    }

    /// Follow the event stream, calling `on_event(name, json)` per event.
    pub(crate) fn follow_events(
        &self,
        session_id: Option<&str>,
        mut on_event: impl FnMut(&str, &str),
    ) -> Result<()> {
        let mut url = format!("{}/events/stream", self.base);
        if let Some(id) = session_id {
            url.push_str("?session_id=");
            url.push_str(&urlencoding::encode(id));
        }
        let resp = self
            .agent
            .get(&url)
            .call()
            .context("request /events/stream")?;
        if !resp.status().is_success() {
            return Err(anyhow::anyhow!("event stream failed with {}", resp.status()));
        }
        read_events(resp.into_body().into_reader(), on_event)
    }
}

fn session_url(base: &str, session_id: &str, action: &str) -> String {
    format!("{base}/sessions/{}/{action}", urlencoding::encode(session_id))
}

const READ_CHUNK: usize = 4096;

/// Decode a `text/event-stream` body, calling `on_event(name, data)` per event.
///
/// Comments (keep-alive pings) and events without data are skipped.
fn read_events(mut reader: impl Read, mut on_event: impl FnMut(&str, &str)) -> Result<()> {
    let chunks = std::iter::from_fn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        match reader.read(&mut buf) {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(Ok(buf))
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Some(Ok(Vec::new())),
            Err(err) => Some(Err(err)),
        }
    });
    let mut events = futures::stream::iter(chunks).eventsource();
    futures::executor::block_on(async {
        while let Some(event) = events.next().await {
            let event = event.context("read /events/stream")?;
            if event.data.is_empty() {
                continue;
            }
            on_event(&event.event, &event.data);
        }
        Ok(())
    })
}

fn read_ok_json<T: DeserializeOwned>(
    resp: ureq::http::Response<ureq::Body>,
    label: &str,
) -> Result<T> {
    if !resp.status().is_success() {
        let status = resp.status();
        let message = read_text(resp).unwrap_or_default();
        return Err(anyhow::anyhow!(
            "/{label} failed with {status}: {}",
            message.trim()
        ));
    }
    read_json(resp, label)
}

fn read_text(mut resp: ureq::http::Response<ureq::Body>) -> Result<String> {
    Ok(resp.body_mut().read_to_string()?)
}

fn read_json<T: DeserializeOwned>(
    mut resp: ureq::http::Response<ureq::Body>,
    label: &str,
) -> Result<T> {
    let body = resp
        .body_mut()
        .read_to_string()
        .with_context(|| format!("read /{label} response body"))?;
    serde_json::from_str(&body).with_context(|| format!("decode /{label} response"))
}
