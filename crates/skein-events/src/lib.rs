/// Diagnostics event system for skein
///
/// The scheduler and the script system never log through a global logger.
/// Instead they are handed an [`EventConsumer`] at construction and report
/// everything noteworthy (micro-thread start/end, script faults, live reloads)
/// as [`EventEnvelope`]s.
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

mod event_log;
mod micro_thread_events;
mod script_events;
mod system_events;

pub use event_log::EventLog;
pub use micro_thread_events::{MicroThreadEvent, MicroThreadEventType};
pub use script_events::{ScriptEvent, ScriptEventType};
pub use system_events::SystemEvent;

// ============================================================================
// Event Source and Context
// ============================================================================

/// Source of the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum EventSource {
    /// Event originated from the micro-thread scheduler
    Scheduler,
    /// Event originated from the script system's lifecycle management
    ScriptSystem,
    /// Event originated from user script code
    Script,
    /// Event originated from the host loop
    Host,
}

/// Context information attached to all events
#[derive(Debug, Clone)]
pub struct EventContext {
    /// Simulation frame during which the event was raised
    pub frame: u64,
    /// Sequence number for this event, relative to its emitter
    pub sequence: u64,
}

impl EventContext {
    pub fn new(frame: u64, sequence: u64) -> Self {
        Self { frame, sequence }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Unified event type
#[derive(Debug, Clone)]
pub enum EventType {
    MicroThread(MicroThreadEvent),
    Script(ScriptEvent),
    System(SystemEvent),
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Complete event envelope
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub event: EventType,
    pub context: EventContext,
    pub timestamp: Instant,
    pub source: EventSource,
}

impl EventEnvelope {
    pub fn new(event: EventType, context: EventContext, source: EventSource) -> Self {
        Self {
            event,
            context,
            timestamp: Instant::now(),
            source,
        }
    }

    pub fn micro_thread_event(
        event: MicroThreadEvent,
        frame: u64,
        sequence: u64,
        source: EventSource,
    ) -> Self {
        Self::new(
            EventType::MicroThread(event),
            EventContext::new(frame, sequence),
            source,
        )
    }

    pub fn script_event(event: ScriptEvent, frame: u64, sequence: u64, source: EventSource) -> Self {
        Self::new(
            EventType::Script(event),
            EventContext::new(frame, sequence),
            source,
        )
    }

    pub fn system_event(event: SystemEvent, frame: u64, sequence: u64, source: EventSource) -> Self {
        Self::new(
            EventType::System(event),
            EventContext::new(frame, sequence),
            source,
        )
    }

    pub fn extract_script_event(&self) -> Option<&ScriptEvent> {
        match &self.event {
            EventType::Script(script_event) => Some(script_event),
            _ => None,
        }
    }

    pub fn extract_micro_thread_event(&self) -> Option<&MicroThreadEvent> {
        match &self.event {
            EventType::MicroThread(event) => Some(event),
            _ => None,
        }
    }
}

// ============================================================================
// Event Consumer Trait
// ============================================================================

/// Trait for consuming diagnostics events
///
/// Consumers live on the simulation thread together with the scheduler, so
/// they are not required to be `Send`.
pub trait EventConsumer: 'static {
    /// Handle an event envelope
    fn handle_event(&mut self, envelope: EventEnvelope);
}

/// Shared handle to a consumer, injected into the scheduler and script system
pub type SharedConsumer = Rc<RefCell<dyn EventConsumer>>;

/// Forwards events to several consumers in registration order
#[derive(Default)]
pub struct FanOutConsumer {
    consumers: Vec<SharedConsumer>,
}

impl FanOutConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, consumer: SharedConsumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl EventConsumer for FanOutConsumer {
    fn handle_event(&mut self, envelope: EventEnvelope) {
        for consumer in &self.consumers {
            consumer.borrow_mut().handle_event(envelope.clone());
        }
    }
}

/// Wrap a consumer into a [`SharedConsumer`]
pub fn shared<C: EventConsumer>(consumer: C) -> SharedConsumer {
    Rc::new(RefCell::new(consumer))
}

// ============================================================================
// Event Emitter
// ============================================================================

/// Numbering and dispatch helper used by event producers
///
/// Emitting without a consumer attached is a no-op. A consumer that is
/// already borrowed (an event raised while the consumer itself is handling
/// one) is skipped with a warning instead of panicking.
#[derive(Default)]
pub struct EventEmitter {
    consumer: Option<SharedConsumer>,
    sequence: u64,
}

impl EventEmitter {
    pub fn new(consumer: Option<SharedConsumer>) -> Self {
        Self {
            consumer,
            sequence: 0,
        }
    }

    pub fn set_consumer(&mut self, consumer: Option<SharedConsumer>) {
        self.consumer = consumer;
    }

    pub fn consumer(&self) -> Option<SharedConsumer> {
        self.consumer.clone()
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    /// Wrap `event` into an envelope and hand it to the consumer
    pub fn emit(&mut self, event: EventType, frame: u64, source: EventSource) {
        let Some(consumer) = &self.consumer else {
            return;
        };

        let sequence = self.sequence;
        self.sequence += 1;

        let envelope = EventEnvelope::new(event, EventContext::new(frame, sequence), source);
        match consumer.try_borrow_mut() {
            Ok(mut consumer) => consumer.handle_event(envelope),
            Err(_) => {
                tracing::warn!(target: "events", "Event consumer busy, dropping event {:?}", envelope.event);
            }
        }
    }
}
