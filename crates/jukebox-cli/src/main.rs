//! Command-line client for `jukebox-server`.
//!
//! Queues tracks, controls playback per session, shows cache usage, and
//! follows the notification stream.

mod server_api;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jukebox_types::{
    EnqueueRequest, EnqueueResponse, PauseResponse, QueueResponse, ResumeResponse, SkipResponse,
    StopResponse, TrackSummary,
};

use crate::server_api::ServerApi;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

/// How many upcoming tracks `queue` prints.
const QUEUE_PREVIEW: usize = 10;

#[derive(Parser, Debug)]
#[command(name = "jukebox-cli", version = VERSION)]
struct Args {
    /// Base URL of the jukebox server, e.g. http://127.0.0.1:8080
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue a URL or search query.
    Play {
        session: String,
        /// URL or search words.
        #[arg(required = true)]
        query: Vec<String>,
        /// Requester display name.
        #[arg(long, default_value = "cli")]
        user: String,
        /// Voice target to join when the session does not exist yet.
        #[arg(long)]
        voice: Option<String>,
        /// Text target for notifications.
        #[arg(long)]
        text: Option<String>,
        /// Resolve when the track reaches the head of the queue.
        #[arg(long)]
        deferred: bool,
    },
    /// Show the current track and upcoming queue.
    Queue { session: String },
    /// Skip the current track.
    Skip { session: String },
    /// Clear the queue and leave voice.
    Stop { session: String },
    Pause { session: String },
    Resume { session: String },
    /// List live sessions.
    Sessions,
    /// Show cache usage.
    Stats,
    /// Follow notification events.
    Events {
        /// Only show events for this session.
        #[arg(long)]
        session: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let api = ServerApi::new(&args.server);
    match args.command {
        Command::Play {
            session,
            query,
            user,
            voice,
            text,
            deferred,
        } => {
            let req = EnqueueRequest {
                query: query.join(" "),
                requested_by: user,
                voice_target: voice,
                text_target: text,
                deferred,
            };
            match api.enqueue(&session, &req)? {
                EnqueueResponse::Queued { position, track } => {
                    println!("Queued #{position}: {}", describe(&track));
                }
                EnqueueResponse::RejectedTooLong {
                    title,
                    duration_secs,
                    max_duration_secs,
                } => {
                    println!(
                        "Rejected `{title}`: {} exceeds the {} limit",
                        format_duration(duration_secs),
                        format_duration(max_duration_secs)
                    );
                }
            }
        }
        Command::Queue { session } => print_queue(&api.queue(&session)?),
        Command::Skip { session } => match api.skip(&session)? {
            SkipResponse::Skipped { track } => println!("Skipped {}", describe(&track)),
            SkipResponse::NothingPlaying => println!("Nothing is playing"),
        },
        Command::Stop { session } => match api.stop(&session)? {
            StopResponse::Stopped => println!("Stopped"),
            StopResponse::NotConnected => println!("Not connected"),
        },
        Command::Pause { session } => match api.pause(&session)? {
            PauseResponse::Paused => println!("Paused"),
            PauseResponse::AlreadyPaused => println!("Already paused"),
            PauseResponse::NothingPlaying => println!("Nothing is playing"),
        },
        Command::Resume { session } => match api.resume(&session)? {
            ResumeResponse::Resumed => println!("Resumed"),
            ResumeResponse::NotPaused => println!("Not paused"),
            ResumeResponse::NothingPlaying => println!("Nothing is playing"),
        },
        Command::Sessions => {
            for id in api.sessions()?.sessions {
                println!("{id}");
            }
        }
        Command::Stats => {
            let stats = api.cache_stats()?;
            println!(
                "{} tracks, {} of {} used",
                stats.track_count,
                format_bytes(stats.total_bytes),
                format_bytes(stats.budget_bytes)
            );
            for entry in stats.largest_entries {
                println!(
                    "  {:>10}  {}",
                    format_bytes(entry.size_bytes),
                    entry.title.unwrap_or(entry.track_id)
                );
            }
            if !stats.downloads_in_flight.is_empty() {
                println!("downloading: {}", stats.downloads_in_flight.join(", "));
            }
        }
        Command::Events { session } => {
            api.follow_events(session.as_deref(), |name, data| {
                println!("{name}: {data}");
            })?;
        }
    }
    Ok(())
}

fn print_queue(queue: &QueueResponse) {
    match &queue.now_playing {
        Some(track) => println!("Now playing: {}", describe(track)),
        None => println!("Nothing is playing"),
    }
    if let Some(state) = &queue.player_state {
        println!("Player: {state}");
    }
    if queue.upcoming.is_empty() {
        return;
    }
    let shown = queue.upcoming.len().min(QUEUE_PREVIEW);
    println!("Upcoming - Next {shown}");
    for (idx, track) in queue.upcoming.iter().take(shown).enumerate() {
        println!("{:>3}. {}", idx + 1, describe(track));
    }
    if queue.upcoming.len() > shown {
        println!("     ... and {} more", queue.upcoming.len() - shown);
    }
}

fn describe(track: &TrackSummary) -> String {
    match track.duration_secs {
        Some(secs) => format!(
            "{} [{}] (requested by {})",
            track.title,
            format_duration(secs),
            track.requested_by
        ),
        None => format!("{} (requested by {})", track.title, track.requested_by),
    }
}

fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
