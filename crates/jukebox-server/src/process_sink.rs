//! Local playback through an external player process.
//!
//! Each `play` spawns the configured program (default `ffplay`). Stop kills the
//! child; pause and resume suspend it with `SIGSTOP`/`SIGCONT` on unix.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::error::SinkError;
use crate::sink::{AudioSink, MediaSource, PlaybackCompletion, PlaybackEnd, VoiceConnector};

const INPUT_PLACEHOLDER: &str = "{input}";
const VOLUME_PLACEHOLDER: &str = "{volume}";

#[derive(Clone, Debug)]
pub struct PlayerCommand {
    pub program: PathBuf,
    /// Arguments; `{volume}` becomes 0..=100 and `{input}` the media. The input
    /// is appended when no placeholder is present.
    pub args: Vec<String>,
}

impl Default for PlayerCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffplay"),
            args: [
                "-nodisp",
                "-autoexit",
                "-loglevel",
                "quiet",
                "-volume",
                VOLUME_PLACEHOLDER,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl PlayerCommand {
    fn render_args(&self, input: &str, volume: f32) -> Vec<String> {
        let volume = ((volume.clamp(0.0, 1.0) * 100.0).round() as u32).to_string();
        let mut has_input = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(INPUT_PLACEHOLDER) {
                    has_input = true;
                }
                arg.replace(VOLUME_PLACEHOLDER, &volume)
                    .replace(INPUT_PLACEHOLDER, input)
            })
            .collect();
        if !has_input {
            args.push(input.to_string());
        }
        args
    }
}

struct ActivePlayback {
    generation: u64,
    pid: Option<u32>,
    paused: bool,
    kill_tx: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct SinkState {
    active: Option<ActivePlayback>,
    generation: u64,
}

pub struct ProcessSink {
    command: PlayerCommand,
    state: Arc<Mutex<SinkState>>,
}

impl ProcessSink {
    pub fn new(command: PlayerCommand) -> Self {
        Self {
            command,
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn signal(&self, paused: bool) -> Result<(), SinkError> {
        let mut state = self.lock();
        let Some(active) = state.active.as_mut() else {
            return Err(SinkError::Rejected("nothing is playing".to_string()));
        };
        let Some(pid) = active.pid else {
            return Err(SinkError::Rejected("player process has no pid".to_string()));
        };
        send_stop_signal(pid, paused)?;
        active.paused = paused;
        Ok(())
    }
}

#[cfg(unix)]
fn send_stop_signal(pid: u32, paused: bool) -> Result<(), SinkError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal = if paused { Signal::SIGSTOP } else { Signal::SIGCONT };
    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|err| SinkError::Rejected(format!("failed to send {signal} to player {pid}: {err}")))
}

#[cfg(not(unix))]
fn send_stop_signal(_pid: u32, _paused: bool) -> Result<(), SinkError> {
    Err(SinkError::Rejected(
        "pause is not supported on this platform".to_string(),
    ))
}

impl AudioSink for ProcessSink {
    fn play(
        &self,
        source: MediaSource,
        volume: f32,
        done: PlaybackCompletion,
    ) -> Result<(), SinkError> {
        self.stop();

        let args = self.command.render_args(&source.as_input(), volume);
        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SinkError::Rejected(format!(
                    "failed to start {}: {err}",
                    self.command.program.display()
                ))
            })?;

        let (kill_tx, kill_rx) = oneshot::channel();
        let generation = {
            let mut state = self.lock();
            let generation = state.generation + 1;
            state.generation = generation;
            state.active = Some(ActivePlayback {
                generation,
                pid: child.id(),
                paused: false,
                kill_tx: Some(kill_tx),
            });
            generation
        };
        tracing::debug!(pid = ?child.id(), input = %source.as_input(), "player started");

        let state = self.state.clone();
        tokio::spawn(async move {
            let end = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => PlaybackEnd::eof(),
                    Ok(status) => PlaybackEnd::failed(format!("player exited with {status}")),
                    Err(err) => PlaybackEnd::failed(format!("player wait failed: {err}")),
                },
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(error = %err, "player kill failed");
                    }
                    PlaybackEnd::stopped()
                }
            };
            {
                let mut state = state.lock().unwrap_or_else(|err| err.into_inner());
                if state
                    .active
                    .as_ref()
                    .is_some_and(|active| active.generation == generation)
                {
                    state.active = None;
                }
            }
            done.complete(end);
        });
        Ok(())
    }

    fn stop(&self) {
        let active = self.lock().active.take();
        if let Some(mut active) = active {
            if active.paused {
                if let Some(pid) = active.pid {
                    let _ = send_stop_signal(pid, false);
                }
            }
            if let Some(tx) = active.kill_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    fn pause(&self) -> Result<(), SinkError> {
        self.signal(true)
    }

    fn resume(&self) -> Result<(), SinkError> {
        self.signal(false)
    }

    fn is_playing(&self) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|active| !active.paused)
    }

    fn is_paused(&self) -> bool {
        self.lock()
            .active
            .as_ref()
            .is_some_and(|active| active.paused)
    }
}

/// Voice connector that plays every session on the local machine.
pub struct LocalVoiceConnector {
    command: PlayerCommand,
    sinks: Mutex<HashMap<String, Arc<ProcessSink>>>,
}

impl LocalVoiceConnector {
    pub fn new(command: PlayerCommand) -> Self {
        Self {
            command,
            sinks: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VoiceConnector for LocalVoiceConnector {
    async fn connect(
        &self,
        session_id: &str,
        voice_target: &str,
    ) -> Result<Arc<dyn AudioSink>, SinkError> {
        let mut sinks = self.sinks.lock().unwrap_or_else(|err| err.into_inner());
        let sink: Arc<dyn AudioSink> = sinks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(ProcessSink::new(self.command.clone())))
            .clone();
        tracing::info!(session_id = %session_id, voice_target = %voice_target, "voice connected");
        Ok(sink)
    }

    async fn disconnect(&self, session_id: &str) {
        let sink = self
            .sinks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(session_id);
        if let Some(sink) = sink {
            sink.stop();
            tracing::info!(session_id = %session_id, "voice disconnected");
        }
    }
}
