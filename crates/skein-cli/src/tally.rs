//! Per-script start and fault counts, reported when the `skein` binary exits.

use std::collections::BTreeMap;

use skein_events::{EventConsumer, EventEnvelope, ScriptEventType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScriptCounts {
    pub starts: u32,
    pub faults: u32,
}

/// Counts starts and faults by script name
///
/// A live reload shows up as a second start of the same name.
#[derive(Debug, Default)]
pub struct ScriptTally {
    counts: BTreeMap<String, ScriptCounts>,
}

impl ScriptTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, script_name: &str) -> ScriptCounts {
        self.counts.get(script_name).copied().unwrap_or_default()
    }

    /// Counts in script name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, ScriptCounts)> {
        self.counts.iter().map(|(name, counts)| (name.as_str(), *counts))
    }
}

impl EventConsumer for ScriptTally {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        let Some(event) = envelope.extract_script_event() else {
            return;
        };

        let is_start = match event.event_type {
            ScriptEventType::Started => true,
            ScriptEventType::Faulted { .. } => false,
            _ => return,
        };

        let counts = self.counts.entry(event.script_name.clone()).or_default();
        if is_start {
            counts.starts += 1;
        } else {
            counts.faults += 1;
        }
    }
}
