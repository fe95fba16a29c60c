//! Directory-backed media cache with size-bounded eviction.
//!
//! Layout under the cache root:
//! - `<key>.<ext>` media payload
//! - `<key>.meta.json` sidecar metadata
//! - `*.part` and friends for in-progress downloads (swept on startup)
//!
//! The index is always derived from the directory listing. Last access time is
//! the media file's mtime, bumped whenever an entry is opened for playback.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use jukebox_types::{CacheEntrySummary, CacheStatsResponse};
use serde::{Deserialize, Serialize};

use crate::download_dedup::{DownloadClaim, DownloadDedup};
use crate::error::DownloadError;
use crate::persistence::SNAPSHOT_FILE;
use crate::resolver::DownloadedMedia;
use crate::track::Track;

const SIDECAR_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIXES: [&str; 4] = [".part", ".tmp", ".ytdl", ".temp"];

/// One committed media file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub track_id: String,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub last_access: SystemTime,
}

/// Metadata written next to each media file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheSidecar {
    pub track_id: String,
    pub title: String,
    pub duration_secs: u64,
    pub webpage_url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    pub ext: String,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheLimits {
    pub budget_bytes: u64,
    /// Estimated size of a new download, reserved before fetching.
    pub download_margin_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    pub total_bytes: u64,
}

type Pins = Arc<Mutex<HashMap<String, usize>>>;

pub struct CacheStore {
    root: PathBuf,
    limits: CacheLimits,
    dedup: DownloadDedup,
    // Serializes commit, pin and eviction against each other.
    write_lock: Mutex<()>,
    pins: Pins,
}

impl CacheStore {
    pub fn new(root: PathBuf, limits: CacheLimits) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            limits,
            dedup: DownloadDedup::new(),
            write_lock: Mutex::new(()),
            pins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Find the committed entry for `track_id`, if any.
    pub fn lookup(&self, track_id: &str) -> io::Result<Option<CacheEntry>> {
        let key = sanitize_key(track_id);
        if let Some(sidecar) = self.read_sidecar(&key) {
            let path = self.root.join(format!("{key}.{}", sidecar.ext));
            match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => return Ok(Some(entry_from(key, path, &meta))),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        Ok(self.scan()?.into_iter().find(|entry| entry.track_id == key))
    }

    /// Pin the entry for playback and bump its access time.
    ///
    /// The pinned file is skipped by eviction until the lease is dropped.
    pub fn open_for_playback(&self, track_id: &str) -> io::Result<Option<CacheLease>> {
        let _guard = self.write_guard();
        let Some(entry) = self.lookup(track_id)? else {
            return Ok(None);
        };
        if let Err(err) = touch(&entry.file_path) {
            tracing::warn!(track_id = %entry.track_id, error = %err, "cache touch failed");
        }
        Ok(Some(self.pin(entry)))
    }

    fn pin(&self, entry: CacheEntry) -> CacheLease {
        *self
            .pins
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .entry(entry.track_id.clone())
            .or_insert(0) += 1;
        CacheLease {
            entry,
            pins: self.pins.clone(),
        }
    }

    pub fn is_pinned(&self, track_id: &str) -> bool {
        self.pinned_keys().contains(&sanitize_key(track_id))
    }

    fn pinned_keys(&self) -> HashSet<String> {
        self.pins
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Claim the exclusive download of `track_id` or join the running one.
    pub fn begin_download(&self, track_id: &str) -> DownloadClaim {
        self.dedup.claim(&sanitize_key(track_id))
    }

    pub fn downloads_in_flight(&self) -> Vec<String> {
        self.dedup.in_flight()
    }

    /// Fresh temporary path for a download of `track_id`.
    pub fn temp_path(&self, track_id: &str) -> PathBuf {
        let key = sanitize_key(track_id);
        self.root
            .join(format!("{key}.{}.part", uuid::Uuid::new_v4().simple()))
    }

    /// Promote a finished download into the cache and pin it for playback.
    ///
    /// On failure the temporary file is removed and nothing is committed.
    pub fn commit(&self, track: &Track, media: &DownloadedMedia) -> Result<CacheLease, DownloadError> {
        let _guard = self.write_guard();
        let key = sanitize_key(&track.id);
        let ext = sanitize_ext(&media.ext);
        let final_path = self.root.join(format!("{key}.{ext}"));

        if let Err(err) = fs::rename(&media.path, &final_path) {
            let _ = fs::remove_file(&media.path);
            return Err(DownloadError::Io(err));
        }

        let sidecar = CacheSidecar {
            track_id: key.clone(),
            title: track.title.clone(),
            duration_secs: track.duration_secs,
            webpage_url: track.webpage_url.clone(),
            thumbnail_url: track.thumbnail_url.clone(),
            ext: ext.clone(),
        };
        if let Err(err) = self.write_sidecar(&key, &sidecar) {
            let _ = fs::remove_file(&final_path);
            return Err(err);
        }

        // Fetchers may stamp the file with a remote mtime; committing is an access.
        if let Err(err) = touch(&final_path) {
            tracing::warn!(track_id = %key, error = %err, "cache touch failed");
        }
        let meta = fs::metadata(&final_path)?;
        let entry = entry_from(key, final_path, &meta);
        tracing::debug!(
            track_id = %entry.track_id,
            size_bytes = entry.size_bytes,
            "cache commit"
        );
        Ok(self.pin(entry))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{SIDECAR_SUFFIX}"))
    }

    fn read_sidecar(&self, key: &str) -> Option<CacheSidecar> {
        let data = fs::read(self.sidecar_path(key)).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn write_sidecar(&self, key: &str, sidecar: &CacheSidecar) -> Result<(), DownloadError> {
        let path = self.sidecar_path(key);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(sidecar)
            .map_err(|err| DownloadError::Io(io::Error::other(err)))?;
        let result = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, &path));
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp);
            return Err(DownloadError::Io(err));
        }
        Ok(())
    }

    /// All committed entries, from the live directory listing.
    pub fn scan(&self) -> io::Result<Vec<CacheEntry>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut entries = Vec::new();
        for item in dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            if name == SNAPSHOT_FILE
                || name.starts_with('.')
                || name.ends_with(SIDECAR_SUFFIX)
                || is_partial(&name)
            {
                continue;
            }
            let Some((key, ext)) = name.split_once('.') else {
                continue;
            };
            if ext.is_empty() || ext.contains('.') {
                continue;
            }
            let meta = match item.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            entries.push(entry_from(key.to_string(), item.path(), &meta));
        }
        Ok(entries)
    }

    pub fn usage_bytes(&self) -> io::Result<u64> {
        Ok(self.scan()?.iter().map(|entry| entry.size_bytes).sum())
    }

    /// Make room for a new download when usage plus the margin would exceed budget.
    pub fn reserve_for_download(&self) -> io::Result<Option<EvictionReport>> {
        let usage = self.usage_bytes()?;
        let CacheLimits {
            budget_bytes,
            download_margin_bytes,
        } = self.limits;
        if usage.saturating_add(download_margin_bytes) <= budget_bytes {
            return Ok(None);
        }
        self.evict_to_budget(budget_bytes.saturating_sub(download_margin_bytes))
            .map(Some)
    }

    /// Remove least recently accessed entries until usage is at most `max_bytes`.
    ///
    /// Runs to convergence: the directory is re-scanned after each round. Pinned
    /// entries are never removed; if only pinned entries remain the pass stops
    /// over budget.
    pub fn evict_to_budget(&self, max_bytes: u64) -> io::Result<EvictionReport> {
        let _guard = self.write_guard();
        let mut report = EvictionReport::default();
        let mut stuck: HashSet<PathBuf> = HashSet::new();

        loop {
            let mut entries = self.scan()?;
            let mut total: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
            report.total_bytes = total;
            if total <= max_bytes {
                break;
            }

            let pinned = self.pinned_keys();
            entries.sort_by(|a, b| {
                a.last_access
                    .cmp(&b.last_access)
                    .then_with(|| a.file_path.cmp(&b.file_path))
            });

            let mut removed_this_round = 0usize;
            for entry in entries {
                if total <= max_bytes {
                    break;
                }
                if pinned.contains(&entry.track_id) || stuck.contains(&entry.file_path) {
                    continue;
                }
                match fs::remove_file(&entry.file_path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(
                            track_id = %entry.track_id,
                            error = %err,
                            "cache eviction failed"
                        );
                        stuck.insert(entry.file_path);
                        continue;
                    }
                }
                let _ = fs::remove_file(self.sidecar_path(&entry.track_id));
                total = total.saturating_sub(entry.size_bytes);
                report.freed_bytes += entry.size_bytes;
                report.removed.push(entry.track_id);
                removed_this_round += 1;
            }
            report.total_bytes = total;

            if removed_this_round == 0 {
                tracing::warn!(
                    total_bytes = total,
                    max_bytes,
                    "cache over budget with nothing evictable"
                );
                break;
            }
        }

        if !report.removed.is_empty() {
            tracing::info!(
                removed = report.removed.len(),
                freed_bytes = report.freed_bytes,
                total_bytes = report.total_bytes,
                "cache eviction"
            );
        }
        Ok(report)
    }

    /// Delete leftovers from interrupted downloads. Returns the number removed.
    pub fn sweep_partial_artifacts(&self) -> io::Result<usize> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };
        let mut removed = 0usize;
        for item in dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().to_string();
            if !is_partial(&name) || !item.file_type()?.is_file() {
                continue;
            }
            match fs::remove_file(item.path()) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "partial sweep failed");
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "swept partial downloads");
        }
        Ok(removed)
    }

    /// Usage summary with the `largest` biggest entries.
    pub fn stats(&self, largest: usize) -> io::Result<CacheStatsResponse> {
        let mut entries = self.scan()?;
        let total_bytes = entries.iter().map(|entry| entry.size_bytes).sum();
        let track_count = entries.len();
        entries.sort_by(|a, b| {
            b.size_bytes
                .cmp(&a.size_bytes)
                .then_with(|| a.track_id.cmp(&b.track_id))
        });
        let largest_entries = entries
            .into_iter()
            .take(largest)
            .map(|entry| CacheEntrySummary {
                title: self.read_sidecar(&entry.track_id).map(|s| s.title),
                track_id: entry.track_id,
                size_bytes: entry.size_bytes,
            })
            .collect();
        Ok(CacheStatsResponse {
            track_count,
            total_bytes,
            budget_bytes: self.limits.budget_bytes,
            largest_entries,
            downloads_in_flight: self.downloads_in_flight(),
        })
    }
}

/// A cache entry held open for playback.
pub struct CacheLease {
    entry: CacheEntry,
    pins: Pins,
}

impl CacheLease {
    pub fn path(&self) -> &Path {
        &self.entry.file_path
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(count) = pins.get_mut(&self.entry.track_id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.entry.track_id);
            }
        }
    }
}

/// Map a track id onto a safe file name stem.
pub fn sanitize_key(track_id: &str) -> String {
    let key: String = track_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if key.is_empty() { "_".to_string() } else { key }
}

fn sanitize_ext(ext: &str) -> String {
    let ext: String = ext
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if ext.is_empty() { "bin".to_string() } else { ext.to_ascii_lowercase() }
}

fn is_partial(name: &str) -> bool {
    PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn entry_from(track_id: String, file_path: PathBuf, meta: &fs::Metadata) -> CacheEntry {
    CacheEntry {
        track_id,
        file_path,
        size_bytes: meta.len(),
        last_access: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

fn touch(path: &Path) -> io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}
