//! In-memory observer for asserting on emitted events

use parking_lot::Mutex;

use crate::observability::{ResilienceEvent, ResilienceObserver};
use crate::resilience::CircuitState;

/// Observer that keeps every event it receives, in order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(String, ResilienceEvent)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(resource, event)` pairs received so far
    pub fn events(&self) -> Vec<(String, ResilienceEvent)> {
        self.events.lock().clone()
    }

    /// Event names in arrival order, e.g. `"request:queued"`
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, event)| event.name()).collect()
    }

    /// Number of events named `name`
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|(_, event)| event.name() == name).count()
    }

    /// Breaker transitions in arrival order
    pub fn state_transitions(&self) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|(_, event)| match event {
                ResilienceEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ResilienceObserver for RecordingObserver {
    fn on_event(&self, resource: &str, event: &ResilienceEvent) {
        self.events.lock().push((resource.to_string(), event.clone()));
    }
}
