//! Configuration loading and parsing.
//!
//! Defines the server config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache_store::CacheLimits;
use crate::player::PlayerSettings;
use crate::process_sink::PlayerCommand;
use crate::ytdlp::YtDlpOptions;

const DEFAULT_CACHE_BUDGET_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const DEFAULT_DOWNLOAD_MARGIN_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_WORKER_THREADS: usize = 4;

/// Top-level server configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Bind address (host:port).
    pub bind: Option<String>,
    /// Cache directory; also holds the session snapshot.
    pub cache_dir: Option<String>,
    /// Total bytes of cached media to keep.
    pub cache_budget_bytes: Option<u64>,
    /// Expected size of a new download, freed before it starts.
    pub download_margin_bytes: Option<u64>,
    /// Longest accepted track in seconds.
    pub max_track_duration_secs: Option<u64>,
    /// Seconds an empty session waits before leaving voice.
    pub idle_timeout_secs: Option<u64>,
    /// Playback volume for new sessions, 0..=1.
    pub default_volume: Option<f32>,
    /// Concurrent resolver and download jobs.
    pub worker_threads: Option<usize>,
    /// Play from the local cache (false streams directly).
    pub cache_enabled: Option<bool>,
    /// Download the next queued track while the current one plays.
    pub prefetch: Option<bool>,
    /// Metadata/download backend.
    pub resolver: Option<ResolverConfig>,
    /// Local player process.
    pub player: Option<PlayerConfig>,
}

/// `[resolver]` table.
#[derive(Debug, Default, Deserialize)]
pub struct ResolverConfig {
    pub program: Option<String>,
    pub extra_args: Option<Vec<String>>,
    pub cookie_file: Option<String>,
    pub search_prefix: Option<String>,
}

/// `[player]` table.
#[derive(Debug, Default, Deserialize)]
pub struct PlayerConfig {
    pub program: Option<String>,
    /// Arguments; supports `{volume}` and `{input}` placeholders.
    pub args: Option<Vec<String>>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct JukeboxConfig {
    pub bind: SocketAddr,
    pub cache_dir: PathBuf,
    pub cache_limits: CacheLimits,
    pub worker_threads: usize,
    pub player_settings: PlayerSettings,
    pub resolver: YtDlpOptions,
    pub player: PlayerCommand,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Apply defaults and validate.
    pub fn resolve(&self) -> Result<JukeboxConfig> {
        let bind = bind_from_config(self)?.unwrap_or_else(default_bind);
        let cache_dir = cache_dir_from_config(self)?;

        let defaults = PlayerSettings::default();
        let player_settings = PlayerSettings {
            max_duration_secs: self
                .max_track_duration_secs
                .unwrap_or(defaults.max_duration_secs),
            idle_timeout: self
                .idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            cache_enabled: self.cache_enabled.unwrap_or(defaults.cache_enabled),
            prefetch: self.prefetch.unwrap_or(defaults.prefetch),
            default_volume: self
                .default_volume
                .unwrap_or(defaults.default_volume)
                .clamp(0.0, 1.0),
        };
        if player_settings.max_duration_secs == 0 {
            anyhow::bail!("max_track_duration_secs must be positive");
        }

        let worker_threads = self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS);
        if worker_threads == 0 {
            anyhow::bail!("worker_threads must be positive");
        }

        Ok(JukeboxConfig {
            bind,
            cache_dir,
            cache_limits: CacheLimits {
                budget_bytes: self
                    .cache_budget_bytes
                    .unwrap_or(DEFAULT_CACHE_BUDGET_BYTES),
                download_margin_bytes: self
                    .download_margin_bytes
                    .unwrap_or(DEFAULT_DOWNLOAD_MARGIN_BYTES),
            },
            worker_threads,
            player_settings,
            resolver: resolver_from_config(self.resolver.as_ref()),
            player: player_from_config(self.player.as_ref()),
        })
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Parse an optional bind address from config.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<Option<SocketAddr>> {
    let Some(bind) = cfg.bind.as_deref() else {
        return Ok(None);
    };
    let addr = bind.parse().with_context(|| format!("parse bind {bind}"))?;
    Ok(Some(addr))
}

/// Extract the cache directory from config.
pub fn cache_dir_from_config(cfg: &ServerConfig) -> Result<PathBuf> {
    let dir = cfg
        .cache_dir
        .as_deref()
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .ok_or_else(|| anyhow::anyhow!("cache_dir is required in config"))?;
    Ok(PathBuf::from(dir))
}

fn resolver_from_config(cfg: Option<&ResolverConfig>) -> YtDlpOptions {
    let mut options = YtDlpOptions::default();
    let Some(cfg) = cfg else {
        return options;
    };
    if let Some(program) = cfg.program.as_deref() {
        options.program = PathBuf::from(program);
    }
    if let Some(args) = cfg.extra_args.clone() {
        options.extra_args = args;
    }
    options.cookie_file = cfg
        .cookie_file
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);
    if let Some(prefix) = cfg.search_prefix.clone() {
        options.search_prefix = prefix;
    }
    options
}

fn player_from_config(cfg: Option<&PlayerConfig>) -> PlayerCommand {
    let mut command = PlayerCommand::default();
    let Some(cfg) = cfg else {
        return command;
    };
    if let Some(program) = cfg.program.as_deref() {
        command.program = PathBuf::from(program);
    }
    if let Some(args) = cfg.args.clone() {
        command.args = args;
    }
    command
}

/// `config.toml` next to the running executable, if present.
pub fn default_config_path() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let path = exe.parent()?.join("config.toml");
    path.exists().then_some(path)
}
