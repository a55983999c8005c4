use crate::{EventConsumer, EventEnvelope, EventType, ScriptEvent, ScriptEventType};

/// Consumer that keeps every event it receives, in order
///
/// Mostly used by tests and diagnostics tooling that wants to inspect what
/// happened during a frame.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<EventEnvelope>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[EventEnvelope] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// All script events, in arrival order
    pub fn script_events(&self) -> impl Iterator<Item = &ScriptEvent> {
        self.events.iter().filter_map(|envelope| match &envelope.event {
            EventType::Script(event) => Some(event),
            _ => None,
        })
    }

    /// Script faults recorded for the script with the given name
    pub fn faults_for(&self, script_name: &str) -> usize {
        self.script_events()
            .filter(|event| event.script_name == script_name && event.is_fault())
            .count()
    }

    /// Number of script events matching `event_type` exactly
    pub fn count_script_events(&self, event_type: &ScriptEventType) -> usize {
        self.script_events()
            .filter(|event| &event.event_type == event_type)
            .count()
    }
}

impl EventConsumer for EventLog {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        self.events.push(envelope);
    }
}
