//! Shared application state.
//!
//! Handed to every HTTP handler through `web::Data`.

use crate::events::EventBus;
use crate::session_registry::SessionRegistry;

pub struct AppState {
    pub registry: SessionRegistry,
    pub events: EventBus,
}

impl AppState {
    pub fn new(registry: SessionRegistry) -> Self {
        let events = registry.services().events.clone();
        Self { registry, events }
    }
}
