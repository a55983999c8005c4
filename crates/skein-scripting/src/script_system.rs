use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use anyhow::anyhow;
use skein_events::{
    EventEmitter, EventSource, EventType, ScriptEvent, ScriptEventType, SharedConsumer,
};
use skein_microthread::{MicroThreadFault, MicroThreadId, Scheduler, SchedulerError};
use tracing::{debug, error, info, trace, warn};

use crate::context::{FrameTime, ScriptContext};
use crate::script::{Behavior, Script, ScriptKind, ScriptState};
use crate::services::ServiceRegistry;
use crate::ScriptResult;

/// User entry point a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum EntryPoint {
    Start,
    Cancel,
    Update,
    Execute,
}

/// Errors returned by the script system when exceptions propagate
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// A synchronous hook returned an error or panicked
    #[error("script {script} failed in {entry_point}: {source:#}")]
    Faulted {
        script: String,
        entry_point: EntryPoint,
        #[source]
        source: anyhow::Error,
    },

    /// An async script's body failed and nothing awaited it
    #[error("async script {script} failed: {source}")]
    AsyncFaulted {
        script: String,
        #[source]
        source: SchedulerError,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ScriptError {
    /// Name of the failing script, when the failure came from user code
    pub fn script_name(&self) -> Option<&str> {
        match self {
            ScriptError::Faulted { script, .. } | ScriptError::AsyncFaulted { script, .. } => {
                Some(script)
            }
            ScriptError::Scheduler(_) => None,
        }
    }

    /// Look at the error originally raised by the script, if it was an `E`
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            ScriptError::Faulted { source, .. } => source.downcast_ref::<E>(),
            ScriptError::AsyncFaulted { source, .. } | ScriptError::Scheduler(source) => {
                source.fault().and_then(|fault| fault.downcast_ref::<E>())
            }
        }
    }
}

/// Drives every registered script once per simulation frame
///
/// Each [`update`](Self::update):
/// 1. starts the scripts added since the previous update, by ascending
///    priority (sync `start` hooks run, async bodies are spawned)
/// 2. runs the micro-thread scheduler once
/// 3. updates every sync script, by ascending priority
///
/// User code is isolated per script. With exception propagation disabled a
/// failing script is logged, reported and deregistered, and the rest of the
/// frame carries on. With it enabled the failure is returned to the caller
/// instead and the script stays registered.
pub struct ScriptSystem {
    scheduler: Scheduler,
    services: Rc<ServiceRegistry>,
    time: Rc<Cell<FrameTime>>,
    events: Rc<RefCell<EventEmitter>>,
    /// Every registered script, in registration order
    registered: Vec<Script>,
    pending_start: Vec<Script>,
    sync_scripts: Vec<Script>,
    async_threads: HashMap<MicroThreadId, Script>,
}

impl ScriptSystem {
    pub fn new() -> Self {
        Self::with_services(ServiceRegistry::new())
    }

    /// Create a script system sharing `services` with every script
    pub fn with_services(services: ServiceRegistry) -> Self {
        Self {
            scheduler: Scheduler::new(),
            services: Rc::new(services),
            time: Rc::new(Cell::new(FrameTime::default())),
            events: Rc::new(RefCell::new(EventEmitter::default())),
            registered: Vec::new(),
            pending_start: Vec::new(),
            sync_scripts: Vec::new(),
            async_threads: HashMap::new(),
        }
    }

    /// Report script and micro-thread diagnostics to `consumer`
    pub fn set_consumer(&mut self, consumer: Option<SharedConsumer>) {
        self.scheduler.set_consumer(consumer.clone());
        self.events.borrow_mut().set_consumer(consumer);
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn propagate_exceptions(&self) -> bool {
        self.scheduler.propagate_exceptions()
    }

    /// Return script failures from [`update`](Self::update) instead of
    /// deregistering the script
    pub fn set_propagate_exceptions(&mut self, propagate: bool) {
        self.scheduler.set_propagate_exceptions(propagate);
    }

    /// Timing of the last update
    pub fn frame_time(&self) -> FrameTime {
        self.time.get()
    }

    pub fn frame(&self) -> u64 {
        self.time.get().frame
    }

    /// Registered scripts, in registration order
    pub fn scripts(&self) -> &[Script] {
        &self.registered
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn pending_start_count(&self) -> usize {
        self.pending_start.len()
    }

    pub fn is_registered(&self, script: &Script) -> bool {
        contains(&self.registered, script)
    }

    /// Context handed to `script`'s entry points
    pub fn context_for(&self, script: &Script) -> ScriptContext {
        ScriptContext::new(
            script.clone(),
            self.time.clone(),
            self.services.clone(),
            self.scheduler.clone(),
            self.events.clone(),
        )
    }

    // ===== Registration =====

    /// Register a script; it is started by the next [`update`](Self::update)
    pub fn add(&mut self, script: Script) {
        if self.is_registered(&script) {
            warn!(target: "scripting", "Script {} ({}) is already registered", script.name(), script.id());
            return;
        }

        debug!(target: "scripting", "Adding script: {} ({}, {})", script.name(), script.id(), script.kind());

        script.set_state(ScriptState::PendingStart);
        if script.kind() == ScriptKind::Sync {
            self.sync_scripts.push(script.clone());
        }
        self.pending_start.push(script.clone());
        self.registered.push(script.clone());

        self.emit(&script, ScriptEventType::Added);
    }

    /// Unregister a script
    ///
    /// A script that was started gets its `cancel` hook called, or its
    /// micro-thread cancelled if it is async. A script still waiting to start
    /// is dropped without running any user code.
    pub fn remove(&mut self, script: &Script) -> Result<(), ScriptError> {
        let was_pending = remove_from(&mut self.pending_start, script);
        let was_registered = remove_from(&mut self.registered, script);
        remove_from(&mut self.sync_scripts, script);

        if !was_pending && !was_registered {
            return Ok(());
        }

        debug!(target: "scripting", "Removing script: {} ({})", script.name(), script.id());
        script.set_state(ScriptState::Unregistered);
        self.emit(script, ScriptEventType::Removed);

        if was_pending || !was_registered {
            return Ok(());
        }

        match script.kind() {
            ScriptKind::Startup | ScriptKind::Sync => {
                let cancelled = self.call_guarded(script, EntryPoint::Cancel, |behavior, ctx| {
                    match behavior {
                        Behavior::Startup(s) => s.cancel(ctx),
                        Behavior::Sync(s) => s.cancel(ctx),
                        Behavior::Async(_) => Ok(()),
                    }
                })?;
                if cancelled {
                    self.emit(script, ScriptEventType::Cancelled);
                }
            }
            ScriptKind::Async => {
                if let Some(thread) = script.micro_thread() {
                    thread.cancel();
                    self.async_threads.remove(&thread.id());
                    self.emit(script, ScriptEventType::Cancelled);
                }
            }
        }

        Ok(())
    }

    /// Flag both sides of a hot swap as live reloading
    ///
    /// The old instance keeps the flag; the new one loses it once it has
    /// been started.
    pub fn live_reload(&mut self, old: &Script, new: &Script) {
        info!(target: "scripting", "Live reloading script {} ({} -> {})", new.name(), old.id(), new.id());

        old.set_live_reloading(true);
        new.set_live_reloading(true);
        self.emit(old, ScriptEventType::LiveReloaded);
        self.emit(new, ScriptEventType::LiveReloaded);
    }

    // ===== Per-frame update =====

    /// Run one simulation frame worth of scripts
    pub fn update(&mut self, time: FrameTime) -> Result<(), ScriptError> {
        self.time.set(time);
        trace!(target: "scripting", "Updating scripts for frame {}", time.frame);

        let mut to_start = std::mem::take(&mut self.pending_start);
        to_start.sort_by_key(Script::priority);

        for (index, script) in to_start.iter().enumerate() {
            if let Err(e) = self.start(script) {
                // Scripts not reached yet start next frame.
                let mut rest = to_start[index + 1..].to_vec();
                rest.append(&mut self.pending_start);
                self.pending_start = rest;
                return Err(e);
            }
        }

        let run_result = self.scheduler.run();
        let async_result = self.handle_async_faults(run_result);
        self.async_threads
            .retain(|_, script| script.micro_thread().is_some_and(|t| !t.is_over()));

        for script in &to_start {
            if script.is_live_reloading() {
                script.set_live_reloading(false);
            }
        }

        async_result?;

        let mut sync_scripts = self.sync_scripts.clone();
        sync_scripts.sort_by_key(Script::priority);

        for script in &sync_scripts {
            if !contains(&self.sync_scripts, script) {
                continue;
            }
            self.call_guarded(script, EntryPoint::Update, |behavior, ctx| match behavior {
                Behavior::Sync(s) => s.update(ctx),
                Behavior::Startup(_) | Behavior::Async(_) => Ok(()),
            })?;
        }

        Ok(())
    }

    fn start(&mut self, script: &Script) -> Result<(), ScriptError> {
        script.set_state(ScriptState::Running);

        match script.kind() {
            ScriptKind::Startup | ScriptKind::Sync => {
                let started = self.call_guarded(script, EntryPoint::Start, |behavior, ctx| {
                    match behavior {
                        Behavior::Startup(s) => s.start(ctx),
                        Behavior::Sync(s) => s.start(ctx),
                        Behavior::Async(_) => Ok(()),
                    }
                })?;
                if started {
                    self.emit(script, ScriptEventType::Started);
                }
            }
            ScriptKind::Async => {
                self.spawn(script);
                self.emit(script, ScriptEventType::Started);
            }
        }

        Ok(())
    }

    fn spawn(&mut self, script: &Script) {
        let body = match &*script.behavior().borrow() {
            Behavior::Async(body) => body.clone(),
            Behavior::Startup(_) | Behavior::Sync(_) => return,
        };

        let ctx = self.context_for(script);
        let name = script.name().to_string();
        let thread = self.scheduler.create();
        thread.set_name(script.name());
        thread.set_priority(script.priority());

        let started = thread.start(move || async move {
            let mut body = body
                .try_borrow_mut()
                .map_err(|_| anyhow!("async script {name} is already executing"))?;
            body.execute(ctx).await
        });

        if let Err(e) = started {
            error!(target: "scripting", "Failed to spawn async script {} ({}): {}", script.name(), script.id(), e);
            return;
        }

        debug!(target: "scripting", "Spawned async script {} on micro-thread {}", script.name(), thread.id());
        script.set_micro_thread(Some(&thread));
        self.async_threads.insert(thread.id(), script.clone());
    }

    // ===== Failure isolation =====

    /// Run one user entry point; `Ok(true)` when it succeeded
    fn call_guarded<F>(
        &mut self,
        script: &Script,
        entry_point: EntryPoint,
        call: F,
    ) -> Result<bool, ScriptError>
    where
        F: FnOnce(&mut Behavior, &ScriptContext) -> ScriptResult,
    {
        let ctx = self.context_for(script);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut behavior = script.behavior().borrow_mut();
            call(&mut *behavior, &ctx)
        }));

        let error = match result {
            Ok(Ok(())) => return Ok(true),
            Ok(Err(e)) => e,
            Err(payload) => anyhow!("panicked: {}", panic_message(payload.as_ref())),
        };

        error!(
            target: "scripting",
            "Unexpected error while executing script {} ({}) in {}: {:#}",
            script.name(),
            script.id(),
            entry_point,
            error
        );
        self.emit(
            script,
            ScriptEventType::Faulted {
                message: format!("{error:#}"),
            },
        );

        if self.propagate_exceptions() {
            return Err(ScriptError::Faulted {
                script: script.name().to_string(),
                entry_point,
                source: error,
            });
        }

        self.deregister_faulted(script);
        Ok(false)
    }

    fn handle_async_faults(&mut self, run_result: Result<(), SchedulerError>) -> Result<(), ScriptError> {
        let mut faulted = Vec::new();

        for MicroThreadFault { id, fault, .. } in self.scheduler.take_faults() {
            let Some(script) = self.async_threads.remove(&id) else {
                continue;
            };

            error!(
                target: "scripting",
                "Unexpected error while executing script {} ({}) in {}: {}",
                script.name(),
                script.id(),
                EntryPoint::Execute,
                fault
            );
            self.emit(
                &script,
                ScriptEventType::Faulted {
                    message: fault.to_string(),
                },
            );

            if !self.propagate_exceptions() {
                self.deregister_faulted(&script);
            }
            faulted.push((id, script));
        }

        let Err(e) = run_result else {
            return Ok(());
        };

        match faulted.iter().find(|(id, _)| *id == e.micro_thread_id()) {
            Some((_, script)) => Err(ScriptError::AsyncFaulted {
                script: script.name().to_string(),
                source: e,
            }),
            None => Err(ScriptError::Scheduler(e)),
        }
    }

    fn deregister_faulted(&mut self, script: &Script) {
        remove_from(&mut self.sync_scripts, script);
        remove_from(&mut self.registered, script);
        remove_from(&mut self.pending_start, script);
        script.set_state(ScriptState::Faulted);
    }

    fn emit(&self, script: &Script, event_type: ScriptEventType) {
        let event = ScriptEvent::new(script.id().as_u64(), script.name(), event_type);
        self.events.borrow_mut().emit(
            EventType::Script(event),
            self.frame(),
            EventSource::ScriptSystem,
        );
    }
}

impl Default for ScriptSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScriptSystem {
    fn drop(&mut self) {
        // Async bodies hold a scheduler handle; drop them so it can go away.
        self.scheduler.clear();
    }
}

impl std::fmt::Debug for ScriptSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSystem")
            .field("frame", &self.frame())
            .field("registered", &self.registered.len())
            .field("pending_start", &self.pending_start.len())
            .field("sync_scripts", &self.sync_scripts.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

fn contains(scripts: &[Script], script: &Script) -> bool {
    scripts.iter().any(|s| s == script)
}

fn remove_from(scripts: &mut Vec<Script>, script: &Script) -> bool {
    match scripts.iter().position(|s| s == script) {
        Some(index) => {
            scripts.remove(index);
            true
        }
        None => false,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StartupScript, SyncScript};

    struct Counter(Rc<Cell<u32>>);

    impl StartupScript for Counter {}

    impl SyncScript for Counter {
        fn update(&mut self, _ctx: &ScriptContext) -> ScriptResult {
            self.0.set(self.0.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_add_registers_pending_script() {
        let mut system = ScriptSystem::new();
        let script = Script::from_sync("counter", Counter(Rc::new(Cell::new(0))));

        system.add(script.clone());
        assert!(system.is_registered(&script));
        assert_eq!(system.pending_start_count(), 1);
        assert_eq!(script.state(), ScriptState::PendingStart);

        system.add(script.clone());
        assert_eq!(system.registered_count(), 1);
    }

    #[test]
    fn test_remove_pending_script_is_silent() {
        let mut system = ScriptSystem::new();
        let calls = Rc::new(Cell::new(0));
        let script = Script::from_sync("counter", Counter(calls.clone()));

        system.add(script.clone());
        system.remove(&script).unwrap();
        system.update(FrameTime::default().advance(Default::default())).unwrap();

        assert_eq!(calls.get(), 0);
        assert_eq!(system.registered_count(), 0);
        assert_eq!(script.state(), ScriptState::Unregistered);
    }

    #[test]
    fn test_panic_message_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&7u32), "unknown panic payload");
    }

    #[test]
    fn test_entry_point_display() {
        assert_eq!(EntryPoint::Update.to_string(), "update");
        assert_eq!(EntryPoint::Execute.to_string(), "execute");
    }
}
