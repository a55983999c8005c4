use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use skein_events::{EventEmitter, EventSource, EventType, ScriptEvent, ScriptEventType};
use skein_microthread::{MicroThread, NextFrame, Scheduler, WhenAll, YieldNow};
use tracing::info;

use crate::script::Script;
use crate::services::ServiceRegistry;

/// Timing of the frame being simulated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTime {
    /// Index of the frame, starting at 1 for the first update
    pub frame: u64,
    /// Time simulated since the first frame
    pub total: Duration,
    /// Time since the previous frame
    pub elapsed: Duration,
}

impl FrameTime {
    pub fn new(frame: u64, total: Duration, elapsed: Duration) -> Self {
        Self {
            frame,
            total,
            elapsed,
        }
    }

    /// Timing of the frame following this one
    pub fn advance(self, elapsed: Duration) -> Self {
        Self {
            frame: self.frame + 1,
            total: self.total + elapsed,
            elapsed,
        }
    }
}

/// Everything a script can reach while it runs
///
/// Sync hooks receive a reference; async bodies own a clone for as long as
/// they run. The frame time seen through the context is always the one of
/// the frame currently being updated.
#[derive(Clone)]
pub struct ScriptContext {
    script: Script,
    time: Rc<Cell<FrameTime>>,
    services: Rc<ServiceRegistry>,
    scheduler: Scheduler,
    events: Rc<RefCell<EventEmitter>>,
}

impl ScriptContext {
    pub(crate) fn new(
        script: Script,
        time: Rc<Cell<FrameTime>>,
        services: Rc<ServiceRegistry>,
        scheduler: Scheduler,
        events: Rc<RefCell<EventEmitter>>,
    ) -> Self {
        Self {
            script,
            time,
            services,
            scheduler,
            events,
        }
    }

    // ===== Script =====

    pub fn script(&self) -> &Script {
        &self.script
    }

    pub fn name(&self) -> &str {
        self.script.name()
    }

    pub fn is_live_reloading(&self) -> bool {
        self.script.is_live_reloading()
    }

    /// Whether the script's micro-thread was asked to stop
    ///
    /// Only async scripts are ever cancelled this way; the body is dropped at
    /// its next suspension point, so this matters for work done between two.
    pub fn is_cancellation_requested(&self) -> bool {
        self.script
            .micro_thread()
            .is_some_and(|thread| thread.is_cancellation_requested())
    }

    // ===== Time =====

    pub fn time(&self) -> FrameTime {
        self.time.get()
    }

    pub fn frame(&self) -> u64 {
        self.time.get().frame
    }

    // ===== Services =====

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Shortcut for `services().get::<T>()`
    pub fn service<T: 'static>(&self) -> Option<Rc<T>> {
        self.services.get::<T>()
    }

    // ===== Scheduling =====

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Suspend the async body until the next frame
    pub fn next_frame(&self) -> NextFrame {
        self.scheduler.next_frame()
    }

    /// Suspend the async body until every micro-thread in `threads` ended
    pub fn when_all<I>(&self, threads: I) -> WhenAll
    where
        I: IntoIterator<Item = MicroThread>,
    {
        self.scheduler.when_all(threads)
    }

    pub fn yield_now(&self) -> YieldNow {
        self.scheduler.yield_now()
    }

    // ===== Diagnostics =====

    /// Log a message on behalf of the script
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(target: "script", "[{}] {}", self.script.name(), message);

        let event = ScriptEvent::new(
            self.script.id().as_u64(),
            self.script.name(),
            ScriptEventType::Log { message },
        );
        self.events.borrow_mut().emit(
            EventType::Script(event),
            self.frame(),
            EventSource::Script,
        );
    }
}
