use skein_events::{
    EventConsumer, EventEnvelope, EventType, MicroThreadEventType, ScriptEventType, SystemEvent,
};
use tracing::{debug, error, info, trace};

/// Event consumer that turns diagnostics events into log lines
///
/// Frame completions are very chatty, so they are logged at trace level;
/// everything else about scripts and micro-threads goes to info or debug.
#[derive(Debug, Default)]
pub struct LoggingConsumer {
    faults: u64,
}

impl LoggingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of script and micro-thread faults seen so far
    pub fn faults(&self) -> u64 {
        self.faults
    }
}

impl EventConsumer for LoggingConsumer {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        let frame = envelope.context.frame;

        match envelope.event {
            EventType::Script(event) => match event.event_type {
                ScriptEventType::Added => {
                    debug!(target: "events", "[frame {}] Script added: {}", frame, event.script_name);
                }
                ScriptEventType::Started => {
                    info!(target: "events", "[frame {}] Script started: {}", frame, event.script_name);
                }
                ScriptEventType::Removed => {
                    info!(target: "events", "[frame {}] Script removed: {}", frame, event.script_name);
                }
                ScriptEventType::Cancelled => {
                    debug!(target: "events", "[frame {}] Script cancelled: {}", frame, event.script_name);
                }
                ScriptEventType::Faulted { message } => {
                    self.faults += 1;
                    error!(target: "events", "[frame {}] SCRIPT FAULT in {}: {}", frame, event.script_name, message);
                }
                ScriptEventType::LiveReloaded => {
                    info!(target: "events", "[frame {}] Script live reloaded: {}", frame, event.script_name);
                }
                ScriptEventType::Log { message } => {
                    info!(target: "events", "[{}] {}", event.script_name, message);
                }
            },
            EventType::MicroThread(event) => {
                let name = event.name.as_deref().unwrap_or("<unnamed>");
                match event.event_type {
                    MicroThreadEventType::Faulted { message } => {
                        self.faults += 1;
                        error!(target: "events", "[frame {}] Micro-thread {} ({}) faulted: {}", frame, event.id, name, message);
                    }
                    other => {
                        trace!(target: "events", "[frame {}] Micro-thread {} ({}): {}", frame, event.id, name, other);
                    }
                }
            }
            EventType::System(event) => match event {
                SystemEvent::ReloadScripts => {
                    info!(target: "events", "[frame {}] Reloading scripts", frame);
                }
                SystemEvent::FrameCompleted {
                    frame,
                    elapsed_micros,
                } => {
                    trace!(target: "events", "Frame {} completed in {}us", frame, elapsed_micros);
                }
                SystemEvent::Shutdown => {
                    info!(target: "events", "[frame {}] Shutdown", frame);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_events::{EventSource, MicroThreadEvent, ScriptEvent};

    #[test]
    fn test_counts_faults() {
        let mut consumer = LoggingConsumer::new();

        consumer.handle_event(EventEnvelope::script_event(
            ScriptEvent::new(1, "spinner", ScriptEventType::Started),
            1,
            0,
            EventSource::ScriptSystem,
        ));
        consumer.handle_event(EventEnvelope::script_event(
            ScriptEvent::new(
                1,
                "spinner",
                ScriptEventType::Faulted {
                    message: "boom".into(),
                },
            ),
            2,
            1,
            EventSource::ScriptSystem,
        ));
        consumer.handle_event(EventEnvelope::micro_thread_event(
            MicroThreadEvent::new(
                7,
                Some("patrol".into()),
                MicroThreadEventType::Faulted {
                    message: "lost".into(),
                },
            ),
            2,
            2,
            EventSource::Scheduler,
        ));

        assert_eq!(consumer.faults(), 2);
    }
}
