//! `yt-dlp` backed track resolver.
//!
//! Shells out to the `yt-dlp` program. Calls block and are expected to run on
//! the worker pool.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde::Deserialize;

use crate::error::{DownloadError, ResolveError};
use crate::resolver::{DownloadedMedia, TrackResolver};
use crate::track::Track;

const FORMAT: &str = "bestaudio/best";

#[derive(Clone, Debug)]
pub struct YtDlpOptions {
    pub program: PathBuf,
    pub extra_args: Vec<String>,
    pub cookie_file: Option<PathBuf>,
    /// Prefix turning free text into a search, e.g. `ytsearch:`.
    pub search_prefix: String,
}

impl Default for YtDlpOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            extra_args: Vec::new(),
            cookie_file: None,
            search_prefix: "ytsearch:".to_string(),
        }
    }
}

pub struct YtDlpResolver {
    options: YtDlpOptions,
}

#[derive(Debug, Default, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    original_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    is_live: Option<bool>,
    #[serde(default)]
    entries: Option<Vec<YtDlpInfo>>,
}

impl YtDlpResolver {
    pub fn new(options: YtDlpOptions) -> Self {
        Self { options }
    }

    fn common_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-f".into(),
            FORMAT.into(),
            "--no-playlist".into(),
            "--no-warnings".into(),
        ];
        if let Some(cookies) = &self.options.cookie_file {
            args.push("--cookies".into());
            args.push(cookies.into());
        }
        args.extend(self.options.extra_args.iter().map(OsString::from));
        args
    }

    fn resolve_args(&self, query: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from("--dump-single-json")];
        args.extend(self.common_args());
        args.push("--".into());
        args.push(normalize_query(query, &self.options.search_prefix).into());
        args
    }

    fn download_args(&self, source: &str, dest: &Path) -> Vec<OsString> {
        let mut args = self.common_args();
        args.extend([
            OsString::from("--no-part"),
            "--force-overwrites".into(),
            "--no-mtime".into(),
            "--no-simulate".into(),
            "--print".into(),
            "after_move:%(ext)s".into(),
            "-o".into(),
            dest.into(),
            "--".into(),
            source.into(),
        ]);
        args
    }

    fn run(&self, args: Vec<OsString>) -> std::io::Result<Output> {
        Command::new(&self.options.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
    }
}

impl TrackResolver for YtDlpResolver {
    fn resolve(&self, query: &str) -> Result<Track, ResolveError> {
        tracing::debug!(query = %query, "resolving");
        let output = self.run(self.resolve_args(query)).map_err(|err| {
            ResolveError::Backend(format!(
                "failed to run {}: {err}",
                self.options.program.display()
            ))
        })?;
        if !output.status.success() {
            return Err(ResolveError::Backend(stderr_tail(&output)));
        }
        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| ResolveError::Backend(format!("unreadable resolver output: {err}")))?;
        track_from_info(info, query)
    }

    fn download(&self, track: &Track, dest: &Path) -> Result<DownloadedMedia, DownloadError> {
        tracing::debug!(track_id = %track.id, dest = %dest.display(), "downloading");
        let output = self
            .run(self.download_args(&track.webpage_url, dest))
            .map_err(|err| {
                DownloadError::Fetch(format!(
                    "failed to run {}: {err}",
                    self.options.program.display()
                ))
            })?;
        if !output.status.success() {
            return Err(DownloadError::Fetch(stderr_tail(&output)));
        }
        let ext = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or("bin")
            .to_string();
        let meta = std::fs::metadata(dest)?;
        if meta.len() == 0 {
            return Err(DownloadError::Fetch(format!(
                "empty download for `{}`",
                track.id
            )));
        }
        Ok(DownloadedMedia {
            path: dest.to_path_buf(),
            ext,
            size_bytes: meta.len(),
        })
    }
}

/// Treat anything that is not a URL as a search query.
pub fn normalize_query(query: &str, search_prefix: &str) -> String {
    let query = query.trim();
    if query.starts_with("http://")
        || query.starts_with("https://")
        || search_prefix.is_empty()
        || query.starts_with(search_prefix)
    {
        return query.to_string();
    }
    format!("{search_prefix}{query}")
}

fn track_from_info(info: YtDlpInfo, query: &str) -> Result<Track, ResolveError> {
    // Searches and playlists collapse to their first entry.
    let info = match info.entries {
        Some(entries) => entries
            .into_iter()
            .next()
            .ok_or_else(|| ResolveError::NotFound(query.to_string()))?,
        None => info,
    };

    let id = info
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ResolveError::Backend("result has no id".to_string()))?;
    let title = info.title.unwrap_or_else(|| id.clone());
    if info.is_live == Some(true) {
        return Err(ResolveError::Unsupported(format!("`{title}` is a live stream")));
    }
    let duration = info
        .duration
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| ResolveError::Unsupported(format!("`{title}` has no known duration")))?;
    let webpage_url = info
        .webpage_url
        .or(info.original_url)
        .unwrap_or_else(|| query.to_string());
    let stream_ref = info.url.unwrap_or_else(|| webpage_url.clone());

    Ok(Track {
        id,
        title,
        webpage_url,
        stream_ref,
        duration_secs: duration.ceil() as u64,
        thumbnail_url: info.thumbnail,
        requested_by: String::new(),
        cached_file_path: None,
    })
}

fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| format!("exited with {}", output.status))
}
