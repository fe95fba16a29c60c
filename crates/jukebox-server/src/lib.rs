//! Per-group audio playback queues sharing one local media cache.
//!
//! A [`session_registry::SessionRegistry`] owns one [`player::SessionPlayer`]
//! per group. Players pull from their [`queue::SessionQueue`], fetch media into
//! the shared [`cache_store::CacheStore`] (one download per track across
//! sessions), and hand it to an [`sink::AudioSink`]. Session state survives
//! restarts through [`persistence`].

pub mod api;
pub mod cache_store;
pub mod config;
pub mod download_dedup;
pub mod error;
pub mod events;
pub mod openapi;
pub mod persistence;
pub mod player;
pub mod process_sink;
pub mod queue;
pub mod resolver;
pub mod session_registry;
pub mod sink;
pub mod startup;
pub mod state;
pub mod status_store;
pub mod track;
pub mod ytdlp;

#[cfg(test)]
pub(crate) mod test_support;
