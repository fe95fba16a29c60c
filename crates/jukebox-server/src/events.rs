//! In-process event bus for session notifications.
//!
//! Provides a lightweight broadcast channel for the presentation layer.

use jukebox_types::JukeboxEvent;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JukeboxEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JukeboxEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; dropped silently when nobody listens.
    pub fn publish(&self, event: JukeboxEvent) {
        tracing::debug!(
            session_id = %event.session_id(),
            event = event.name(),
            "event"
        );
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
