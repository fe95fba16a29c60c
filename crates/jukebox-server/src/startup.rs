//! Actix server startup + app wiring.
//!
//! Builds the cache, collaborators and session registry, restores the last
//! snapshot, then serves the HTTP control surface until Ctrl+C. Shutdown
//! writes the final snapshot before the server stops.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::Error;
use actix_web::{App, HttpServer, web};
use anyhow::{Context as _, Result};
use futures_util::future::{ok, LocalBoxFuture, Ready};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::cache_store::CacheStore;
use crate::config::{self, JukeboxConfig};
use crate::events::EventBus;
use crate::openapi;
use crate::persistence::{SnapshotRequest, SnapshotStore};
use crate::player::PlaybackServices;
use crate::process_sink::LocalVoiceConnector;
use crate::resolver::WorkerPool;
use crate::session_registry::SessionRegistry;
use crate::state::AppState;
use crate::ytdlp::YtDlpResolver;

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub bind: Option<SocketAddr>,
    pub cache_dir: Option<PathBuf>,
}

/// Build server state and start the Actix HTTP server.
pub async fn run(overrides: Overrides) -> Result<()> {
    let cfg = load_config(&overrides)?;
    tracing::info!(
        bind = %cfg.bind,
        cache_dir = %cfg.cache_dir.display(),
        budget_bytes = cfg.cache_limits.budget_bytes,
        cache_enabled = cfg.player_settings.cache_enabled,
        "starting jukebox-server"
    );

    let registry = build_registry(&cfg)?;
    let restored = registry.restore().await;
    if restored > 0 {
        tracing::info!(sessions = restored, "restored sessions from snapshot");
    }

    let state = web::Data::new(AppState::new(registry.clone()));
    let server = HttpServer::new(move || {
        App::new()
            .wrap(FilteredLogger)
            .app_data(state.clone())
            .configure(api::configure)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
            )
    })
    .disable_signals()
    .bind(cfg.bind)
    .with_context(|| format!("bind {}", cfg.bind))?
    .run();

    setup_shutdown(server.handle(), registry)?;
    server.await.context("http server")?;
    Ok(())
}

/// Persist every live session, then stop the server.
async fn graceful_shutdown<F, Fut>(registry: &SessionRegistry, stop_server: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    match registry.persist_now().await {
        Ok(sessions) => tracing::info!(sessions, "final snapshot written"),
        Err(err) => tracing::warn!(error = %err, "final snapshot failed"),
    }
    stop_server().await;
}

/// Cache, collaborators and registry for a resolved config.
pub fn build_registry(cfg: &JukeboxConfig) -> Result<SessionRegistry> {
    let cache = CacheStore::new(cfg.cache_dir.clone(), cfg.cache_limits)
        .with_context(|| format!("open cache dir {:?}", cfg.cache_dir))?;
    if let Err(err) = cache.sweep_partial_artifacts() {
        tracing::warn!(error = %err, "partial download sweep failed");
    }

    let services = PlaybackServices {
        resolver: Arc::new(YtDlpResolver::new(cfg.resolver.clone())),
        cache: Arc::new(cache),
        pool: WorkerPool::new(cfg.worker_threads),
        events: EventBus::new(),
        snapshots: SnapshotRequest::new(),
        settings: cfg.player_settings.clone(),
    };
    Ok(SessionRegistry::new(
        services,
        Arc::new(LocalVoiceConnector::new(cfg.player.clone())),
        SnapshotStore::new(&cfg.cache_dir),
    ))
}

/// Load the config file and apply command-line overrides.
fn load_config(overrides: &Overrides) -> Result<JukeboxConfig> {
    let path = overrides
        .config
        .clone()
        .or_else(config::default_config_path);
    let mut file = match path.as_ref() {
        Some(path) => config::ServerConfig::load(path)?,
        None => config::ServerConfig::default(),
    };
    if let Some(dir) = overrides.cache_dir.as_ref() {
        file.cache_dir = Some(dir.to_string_lossy().to_string());
    }
    let mut cfg = file
        .resolve()
        .context("resolve config (set cache_dir via --config or --cache-dir)")?;
    if let Some(bind) = overrides.bind {
        cfg.bind = bind;
    }
    Ok(cfg)
}

/// Install Ctrl+C handler to stop the HTTP server gracefully.
fn setup_shutdown(
    server: actix_web::dev::ServerHandle,
    registry: SessionRegistry,
) -> Result<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install ctrl+c handler")?;
    actix_web::rt::spawn(async move {
        if rx.recv().await.is_some() {
            tracing::info!("shutting down");
            graceful_shutdown(&registry, move || async move { server.stop(true).await }).await;
        }
    });
    Ok(())
}

fn should_log_path(path: &str) -> bool {
    !(path == "/health" || path.starts_with("/swagger-ui") || path.ends_with("/stream"))
}

/// Actix middleware that filters noisy paths from logging.
struct FilteredLogger;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for FilteredLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = FilteredLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(FilteredLoggerMiddleware { service })
    }
}

/// Service wrapper that applies the logging filter.
struct FilteredLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for FilteredLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let path = req.path().to_string();
        let should_log = should_log_path(&path);
        let method = req.method().clone();
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            if should_log {
                tracing::info!(
                    method = %method,
                    path = %path,
                    status = %res.status().as_u16(),
                    elapsed_ms = %start.elapsed().as_millis(),
                    "http request"
                );
            }
            Ok(res)
        })
    }
}
