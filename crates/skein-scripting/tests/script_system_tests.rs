// Integration tests for the script system

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use skein_events::{EventLog, ScriptEventType};
use skein_scripting::{
    AsyncScript, EntityId, EntryPoint, FrameTime, Script, ScriptComponent, ScriptContext,
    ScriptError, ScriptProcessor, ScriptResult, ScriptState, ScriptSystem, ServiceRegistry,
    StartupScript, SyncScript,
};

type Trace = Rc<RefCell<Vec<String>>>;

fn trace() -> Trace {
    Rc::new(RefCell::new(Vec::new()))
}

#[derive(Debug, thiserror::Error)]
#[error("invalid operation")]
struct InvalidOperation;

/// Records every hook call as `"<label>.<hook>"`
struct Recorder {
    label: &'static str,
    trace: Trace,
}

impl Recorder {
    fn script(label: &'static str, trace: &Trace, priority: i32) -> Script {
        Script::from_sync(
            label,
            Recorder {
                label,
                trace: trace.clone(),
            },
        )
        .with_priority(priority)
    }

    fn push(&self, hook: &str) {
        self.trace.borrow_mut().push(format!("{}.{}", self.label, hook));
    }
}

impl StartupScript for Recorder {
    fn start(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        self.push("start");
        Ok(())
    }

    fn cancel(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        self.push("cancel");
        Ok(())
    }
}

impl SyncScript for Recorder {
    fn update(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        self.push("update");
        Ok(())
    }
}

/// Fails every update
struct Failing {
    updates: Rc<Cell<u32>>,
}

impl StartupScript for Failing {}

impl SyncScript for Failing {
    fn update(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        self.updates.set(self.updates.get() + 1);
        Err(InvalidOperation.into())
    }
}

/// Refuses to be cancelled
struct BadCancel;

impl StartupScript for BadCancel {
    fn cancel(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        Err(InvalidOperation.into())
    }
}

/// Waits one frame, then raises a flag
struct FlagAfterFrame {
    flag: Rc<Cell<bool>>,
}

impl AsyncScript for FlagAfterFrame {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
        async move {
            ctx.next_frame().await;
            self.flag.set(true);
            Ok(())
        }
        .boxed_local()
    }
}

/// Counts frames until cancelled
struct Ticker {
    ticks: Rc<Cell<u32>>,
}

impl AsyncScript for Ticker {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
        async move {
            loop {
                self.ticks.set(self.ticks.get() + 1);
                ctx.next_frame().await;
            }
        }
        .boxed_local()
    }
}

/// Fails after its first frame
struct AsyncFailing;

impl AsyncScript for AsyncFailing {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
        async move {
            ctx.next_frame().await;
            Err(InvalidOperation.into())
        }
        .boxed_local()
    }
}

struct Frames {
    time: FrameTime,
}

impl Frames {
    fn new() -> Self {
        Self {
            time: FrameTime::default(),
        }
    }

    fn next(&mut self) -> FrameTime {
        self.time = self.time.advance(Duration::from_millis(16));
        self.time
    }
}

fn with_log(system: &mut ScriptSystem) -> Rc<RefCell<EventLog>> {
    let log = Rc::new(RefCell::new(EventLog::new()));
    system.set_consumer(Some(log.clone()));
    log
}

#[test]
fn test_lower_priority_updates_first() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let calls = trace();

    system.add(Recorder::script("a", &calls, 10));
    system.add(Recorder::script("b", &calls, 5));
    system.update(frames.next()).unwrap();

    let updates: Vec<String> = calls
        .borrow()
        .iter()
        .filter(|c| c.ends_with(".update"))
        .cloned()
        .collect();
    assert_eq!(updates, vec!["b.update", "a.update"]);
}

#[test]
fn test_priority_order_holds_every_frame() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let calls = trace();

    for (label, priority) in [("p7", 7), ("p-2", -2), ("p30", 30), ("p0", 0)] {
        system.add(Recorder::script(label, &calls, priority));
    }

    for _ in 0..3 {
        calls.borrow_mut().clear();
        system.update(frames.next()).unwrap();
        let updates: Vec<String> = calls
            .borrow()
            .iter()
            .filter(|c| c.ends_with(".update"))
            .cloned()
            .collect();
        assert_eq!(updates, vec!["p-2.update", "p0.update", "p7.update", "p30.update"]);
    }
}

#[test]
fn test_equal_priorities_keep_registration_order() {
    let mut system = ScriptSystem::new();
    let calls = trace();

    system.add(Recorder::script("first", &calls, 1));
    system.add(Recorder::script("second", &calls, 1));
    system.add(Recorder::script("third", &calls, 1));
    system.update(Frames::new().next()).unwrap();

    assert_eq!(
        *calls.borrow(),
        vec![
            "first.start",
            "second.start",
            "third.start",
            "first.update",
            "second.update",
            "third.update"
        ]
    );
}

#[test]
fn test_start_happens_before_any_update() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let calls = trace();

    system.add(Recorder::script("old", &calls, 0));
    system.update(frames.next()).unwrap();
    calls.borrow_mut().clear();

    // Higher priority value: starts after nothing else, yet before every update.
    system.add(Recorder::script("new", &calls, 100));
    system.update(frames.next()).unwrap();

    assert_eq!(*calls.borrow(), vec!["new.start", "old.update", "new.update"]);
}

#[test]
fn test_async_script_resumes_on_second_update() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let flag = Rc::new(Cell::new(false));

    let script = Script::from_async("flagger", FlagAfterFrame { flag: flag.clone() });
    system.add(script.clone());

    system.update(frames.next()).unwrap();
    assert!(!flag.get());
    assert!(script.micro_thread().is_some());

    system.update(frames.next()).unwrap();
    assert!(flag.get());
    assert!(script.micro_thread().is_none());
}

#[test]
fn test_async_script_runs_before_sync_updates() {
    struct Marker {
        trace: Trace,
    }

    impl AsyncScript for Marker {
        fn execute(&mut self, _ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
            async move {
                self.trace.borrow_mut().push("async.execute".to_string());
                Ok(())
            }
            .boxed_local()
        }
    }

    let mut system = ScriptSystem::new();
    let calls = trace();
    system.add(Recorder::script("sync", &calls, 0));
    system.add(Script::from_async("async", Marker { trace: calls.clone() }));
    system.update(Frames::new().next()).unwrap();

    assert_eq!(*calls.borrow(), vec!["sync.start", "async.execute", "sync.update"]);
}

#[test]
fn test_failing_script_is_isolated() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let calls = trace();
    let updates = Rc::new(Cell::new(0));

    system.add(Recorder::script("one", &calls, 1));
    let failing = Script::from_sync("two", Failing { updates: updates.clone() }).with_priority(2);
    system.add(failing.clone());
    system.add(Recorder::script("three", &calls, 3));

    for _ in 0..3 {
        system.update(frames.next()).unwrap();
    }

    let updates_seen: Vec<String> = calls
        .borrow()
        .iter()
        .filter(|c| c.ends_with(".update"))
        .cloned()
        .collect();
    assert_eq!(
        updates_seen,
        vec![
            "one.update",
            "three.update",
            "one.update",
            "three.update",
            "one.update",
            "three.update"
        ]
    );
    assert_eq!(updates.get(), 1);
    assert_eq!(failing.state(), ScriptState::Faulted);
    assert!(!system.is_registered(&failing));
}

#[test]
fn test_failing_script_logs_once() {
    let mut system = ScriptSystem::new();
    let log = with_log(&mut system);
    let mut frames = Frames::new();
    let updates = Rc::new(Cell::new(0));

    system.add(Script::from_sync("broken", Failing { updates: updates.clone() }));
    for _ in 0..3 {
        system.update(frames.next()).unwrap();
    }

    assert_eq!(updates.get(), 1);
    assert_eq!(log.borrow().faults_for("broken"), 1);
}

#[test]
fn test_failure_propagates_when_enabled() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut frames = Frames::new();
    let calls = trace();
    let updates = Rc::new(Cell::new(0));

    system.add(Recorder::script("one", &calls, 1));
    let failing = Script::from_sync("two", Failing { updates: updates.clone() }).with_priority(2);
    system.add(failing.clone());
    system.add(Recorder::script("three", &calls, 3));

    let err = system.update(frames.next()).unwrap_err();
    assert!(matches!(
        &err,
        ScriptError::Faulted { entry_point: EntryPoint::Update, .. }
    ));
    assert_eq!(err.script_name(), Some("two"));
    assert!(err.downcast_ref::<InvalidOperation>().is_some());

    // The script stays registered and fails again next frame.
    assert!(system.is_registered(&failing));
    assert!(system.update(frames.next()).is_err());
    assert_eq!(updates.get(), 2);
}

#[test]
fn test_failed_start_leaves_later_scripts_for_next_update() {
    struct FailingStart;

    impl StartupScript for FailingStart {
        fn start(&mut self, _ctx: &ScriptContext) -> ScriptResult {
            Err(InvalidOperation.into())
        }
    }

    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut frames = Frames::new();
    let calls = trace();

    system.add(Recorder::script("late", &calls, 2));
    system.add(Script::from_startup("broken", FailingStart));
    system.add(Recorder::script("early", &calls, 1));

    let err = system.update(frames.next()).unwrap_err();
    assert!(matches!(
        &err,
        ScriptError::Faulted { entry_point: EntryPoint::Start, .. }
    ));
    assert_eq!(err.script_name(), Some("broken"));
    assert!(calls.borrow().is_empty());
    assert_eq!(system.pending_start_count(), 2);

    system.update(frames.next()).unwrap();
    assert_eq!(
        *calls.borrow(),
        vec!["early.start", "late.start", "early.update", "late.update"]
    );
    assert_eq!(system.pending_start_count(), 0);
}

#[test]
fn test_panicking_hook_is_treated_as_failure() {
    struct Panicky;

    impl StartupScript for Panicky {
        fn start(&mut self, _ctx: &ScriptContext) -> ScriptResult {
            panic!("start exploded");
        }
    }

    let mut system = ScriptSystem::new();
    let log = with_log(&mut system);
    let script = Script::from_startup("panicky", Panicky);
    system.add(script.clone());
    system.update(Frames::new().next()).unwrap();

    assert_eq!(script.state(), ScriptState::Faulted);
    assert_eq!(
        log.borrow().count_script_events(&ScriptEventType::Faulted {
            message: "panicked: start exploded".to_string()
        }),
        1
    );
}

#[test]
fn test_remove_started_script_calls_cancel() {
    let mut system = ScriptSystem::new();
    let calls = trace();
    let script = Recorder::script("gone", &calls, 0);

    system.add(script.clone());
    system.update(Frames::new().next()).unwrap();
    system.remove(&script).unwrap();

    assert_eq!(*calls.borrow(), vec!["gone.start", "gone.update", "gone.cancel"]);
    assert_eq!(script.state(), ScriptState::Unregistered);
    assert_eq!(system.registered_count(), 0);
}

#[test]
fn test_remove_unstarted_script_runs_no_user_code() {
    let mut system = ScriptSystem::new();
    let calls = trace();
    let script = Recorder::script("never", &calls, 0);

    system.add(script.clone());
    system.remove(&script).unwrap();
    system.update(Frames::new().next()).unwrap();

    assert!(calls.borrow().is_empty());
}

#[test]
fn test_failing_cancel_is_isolated() {
    let mut system = ScriptSystem::new();
    let log = with_log(&mut system);
    let script = Script::from_startup("bad-cancel", BadCancel);
    system.add(script.clone());
    system.update(Frames::new().next()).unwrap();

    system.remove(&script).unwrap();
    assert_eq!(log.borrow().faults_for("bad-cancel"), 1);
    assert_eq!(log.borrow().count_script_events(&ScriptEventType::Cancelled), 0);
}

#[test]
fn test_remove_cancels_async_script() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let ticks = Rc::new(Cell::new(0));

    let script = Script::from_async("ticker", Ticker { ticks: ticks.clone() });
    system.add(script.clone());
    system.update(frames.next()).unwrap();
    system.update(frames.next()).unwrap();
    assert_eq!(ticks.get(), 2);

    let thread = script.micro_thread().unwrap();
    system.remove(&script).unwrap();
    assert!(thread.is_cancellation_requested());

    system.update(frames.next()).unwrap();
    system.update(frames.next()).unwrap();
    assert_eq!(ticks.get(), 2);
    assert!(thread.is_over());
    assert_eq!(system.scheduler().micro_thread_count(), 0);
}

#[test]
fn test_async_fault_deregisters_script() {
    let mut system = ScriptSystem::new();
    let log = with_log(&mut system);
    let mut frames = Frames::new();

    let script = Script::from_async("async-broken", AsyncFailing);
    system.add(script.clone());
    system.update(frames.next()).unwrap();
    system.update(frames.next()).unwrap();

    assert_eq!(script.state(), ScriptState::Faulted);
    assert!(!system.is_registered(&script));
    assert_eq!(log.borrow().faults_for("async-broken"), 1);
}

#[test]
fn test_async_fault_propagates_when_enabled() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut frames = Frames::new();

    system.add(Script::from_async("async-broken", AsyncFailing));
    system.update(frames.next()).unwrap();

    let err = system.update(frames.next()).unwrap_err();
    assert!(matches!(&err, ScriptError::AsyncFaulted { script, .. } if script == "async-broken"));
    assert!(err.downcast_ref::<InvalidOperation>().is_some());
}

#[test]
fn test_async_priority_follows_script() {
    let mut system = ScriptSystem::new();
    let ticks = Rc::new(Cell::new(0));

    let script = Script::from_async("ticker", Ticker { ticks }).with_priority(4);
    system.add(script.clone());
    system.update(Frames::new().next()).unwrap();

    let thread = script.micro_thread().unwrap();
    assert_eq!(thread.priority(), 4);
    assert_eq!(thread.name().as_deref(), Some("ticker"));

    script.set_priority(-1);
    assert_eq!(thread.priority(), -1);
}

#[test]
fn test_live_reload_flags() {
    let mut system = ScriptSystem::new();
    let mut frames = Frames::new();
    let calls = trace();

    let old = Recorder::script("mover", &calls, 0);
    system.add(old.clone());
    system.update(frames.next()).unwrap();

    let new = Recorder::script("mover", &calls, 0);
    system.live_reload(&old, &new);
    assert!(old.is_live_reloading());
    assert!(new.is_live_reloading());

    system.remove(&old).unwrap();
    system.add(new.clone());
    system.update(frames.next()).unwrap();

    assert!(old.is_live_reloading());
    assert!(!new.is_live_reloading());
}

#[test]
fn test_context_exposes_services_and_time() {
    struct Score(Cell<u32>);

    struct Scorer {
        seen_frames: Rc<RefCell<Vec<u64>>>,
    }

    impl StartupScript for Scorer {}

    impl SyncScript for Scorer {
        fn update(&mut self, ctx: &ScriptContext) -> ScriptResult {
            let score = ctx
                .service::<Score>()
                .ok_or_else(|| anyhow::anyhow!("score service missing"))?;
            score.0.set(score.0.get() + 10);
            self.seen_frames.borrow_mut().push(ctx.frame());
            ctx.log(format!("score is now {}", score.0.get()));
            Ok(())
        }
    }

    let mut services = ServiceRegistry::new();
    services.insert(Score(Cell::new(0)));
    let mut system = ScriptSystem::with_services(services);
    let log = with_log(&mut system);
    let mut frames = Frames::new();

    let seen_frames = Rc::new(RefCell::new(Vec::new()));
    system.add(Script::from_sync(
        "scorer",
        Scorer {
            seen_frames: seen_frames.clone(),
        },
    ));
    system.update(frames.next()).unwrap();
    system.update(frames.next()).unwrap();

    assert_eq!(*seen_frames.borrow(), vec![1, 2]);
    assert_eq!(system.services().get::<Score>().unwrap().0.get(), 20);
    assert_eq!(
        log.borrow().count_script_events(&ScriptEventType::Log {
            message: "score is now 20".to_string()
        }),
        1
    );
}

#[test]
fn test_lifecycle_events() {
    let mut system = ScriptSystem::new();
    let log = with_log(&mut system);
    let calls = trace();
    let script = Recorder::script("tracked", &calls, 0);

    system.add(script.clone());
    system.update(Frames::new().next()).unwrap();
    system.remove(&script).unwrap();

    let events: Vec<ScriptEventType> = log
        .borrow()
        .script_events()
        .map(|e| e.event_type.clone())
        .collect();
    assert_eq!(
        events,
        vec![
            ScriptEventType::Added,
            ScriptEventType::Started,
            ScriptEventType::Removed,
            ScriptEventType::Cancelled
        ]
    );
}

#[test]
fn test_sync_registers_replacement_when_old_cancel_fails() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut processor = ScriptProcessor::new();
    let mut frames = Frames::new();
    let calls = trace();
    let entity = EntityId(1);

    let old = Script::from_startup("old", BadCancel);
    processor
        .attach(entity, ScriptComponent::new().with_script(old.clone()), &mut system)
        .unwrap();
    system.update(frames.next()).unwrap();

    let new = Recorder::script("new", &calls, 0);
    let component = processor.component_mut(entity).unwrap();
    assert!(component.replace(&old, new.clone()));

    let err = processor.sync(&mut system).unwrap_err();
    assert!(matches!(
        &err,
        ScriptError::Faulted { entry_point: EntryPoint::Cancel, .. }
    ));
    assert!(!system.is_registered(&old));
    assert!(system.is_registered(&new));
    assert_eq!(new.owner(), Some(entity));

    for _ in 0..3 {
        processor.sync(&mut system).unwrap();
        system.update(frames.next()).unwrap();
    }
    assert_eq!(
        *calls.borrow(),
        vec!["new.start", "new.update", "new.update", "new.update"]
    );
}

#[test]
fn test_sync_applies_changes_after_a_failed_removal() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut processor = ScriptProcessor::new();
    let mut frames = Frames::new();
    let calls = trace();
    let entity = EntityId(3);

    let stubborn = Script::from_startup("stubborn", BadCancel);
    processor
        .attach(entity, ScriptComponent::new().with_script(stubborn.clone()), &mut system)
        .unwrap();
    system.update(frames.next()).unwrap();

    let component = processor.component_mut(entity).unwrap();
    assert!(component.remove(&stubborn));
    let added = Recorder::script("added", &calls, 0);
    component.push(added.clone());

    assert!(processor.sync(&mut system).is_err());
    assert!(system.is_registered(&added));

    system.update(frames.next()).unwrap();
    assert_eq!(*calls.borrow(), vec!["added.start", "added.update"]);
}

#[test]
fn test_detach_unregisters_every_script_when_cancel_fails() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut processor = ScriptProcessor::new();
    let mut frames = Frames::new();
    let calls = trace();
    let entity = EntityId(7);

    let a = Script::from_startup("a", BadCancel);
    let b = Recorder::script("b", &calls, 1);
    let component = ScriptComponent::new()
        .with_script(a.clone())
        .with_script(b.clone());
    processor.attach(entity, component, &mut system).unwrap();
    system.update(frames.next()).unwrap();
    calls.borrow_mut().clear();

    let err = processor.detach(entity, &mut system).unwrap_err();
    assert_eq!(err.script_name(), Some("a"));
    assert_eq!(processor.entity_count(), 0);
    assert!(!system.is_registered(&a));
    assert!(!system.is_registered(&b));
    assert_eq!(b.owner(), None);

    system.update(frames.next()).unwrap();
    assert_eq!(*calls.borrow(), vec!["b.cancel"]);
    assert_eq!(system.registered_count(), 0);
}

#[test]
fn test_reattach_replaces_scripts_when_cancel_fails() {
    let mut system = ScriptSystem::new();
    system.set_propagate_exceptions(true);
    let mut processor = ScriptProcessor::new();
    let mut frames = Frames::new();
    let calls = trace();
    let entity = EntityId(9);

    let first = Script::from_startup("first", BadCancel);
    processor
        .attach(entity, ScriptComponent::new().with_script(first.clone()), &mut system)
        .unwrap();
    system.update(frames.next()).unwrap();

    let second = Recorder::script("second", &calls, 0);
    let result = processor.attach(
        entity,
        ScriptComponent::new().with_script(second.clone()),
        &mut system,
    );
    assert!(result.is_err());
    assert!(!system.is_registered(&first));
    assert!(system.is_registered(&second));
    assert_eq!(processor.entity_count(), 1);

    system.update(frames.next()).unwrap();
    assert_eq!(*calls.borrow(), vec!["second.start", "second.update"]);
}
