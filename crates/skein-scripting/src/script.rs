use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use skein_microthread::{MicroThread, WeakMicroThread};

use crate::component::EntityId;
use crate::{AsyncScript, StartupScript, SyncScript};

static NEXT_SCRIPT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a script instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptId(u64);

impl ScriptId {
    fn next() -> Self {
        ScriptId(NEXT_SCRIPT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a script is in its lifecycle, as seen by the script system
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ScriptState {
    Unregistered,
    /// Added, waiting for the next update to be started
    PendingStart,
    Running,
    /// Failed with exception propagation disabled; never scheduled again
    Faulted,
}

/// Which entry points a script exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ScriptKind {
    Startup,
    Sync,
    Async,
}

pub(crate) enum Behavior {
    Startup(Box<dyn StartupScript>),
    Sync(Box<dyn SyncScript>),
    /// Shared with the micro-thread body while it runs
    Async(Rc<RefCell<Box<dyn AsyncScript>>>),
}

impl Behavior {
    fn kind(&self) -> ScriptKind {
        match self {
            Behavior::Startup(_) => ScriptKind::Startup,
            Behavior::Sync(_) => ScriptKind::Sync,
            Behavior::Async(_) => ScriptKind::Async,
        }
    }
}

struct ScriptInner {
    id: ScriptId,
    name: String,
    type_name: RefCell<Option<String>>,
    priority: Cell<i32>,
    is_live_reloading: Cell<bool>,
    state: Cell<ScriptState>,
    owner: Cell<Option<EntityId>>,
    micro_thread: RefCell<WeakMicroThread>,
    kind: ScriptKind,
    behavior: RefCell<Behavior>,
}

/// Handle to a user script
///
/// Cloning the handle does not clone the script: every clone refers to the
/// same instance. The owning [`ScriptComponent`](crate::ScriptComponent) and
/// the [`ScriptSystem`](crate::ScriptSystem) both hold one.
#[derive(Clone)]
pub struct Script {
    inner: Rc<ScriptInner>,
}

impl Script {
    fn new(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            inner: Rc::new(ScriptInner {
                id: ScriptId::next(),
                name: name.into(),
                type_name: RefCell::new(None),
                priority: Cell::new(0),
                is_live_reloading: Cell::new(false),
                state: Cell::new(ScriptState::Unregistered),
                owner: Cell::new(None),
                micro_thread: RefCell::new(WeakMicroThread::default()),
                kind: behavior.kind(),
                behavior: RefCell::new(behavior),
            }),
        }
    }

    /// Wrap a script that only has start/cancel hooks
    pub fn from_startup(name: impl Into<String>, script: impl StartupScript) -> Self {
        Self::new(name, Behavior::Startup(Box::new(script)))
    }

    /// Wrap a script updated every frame
    pub fn from_sync(name: impl Into<String>, script: impl SyncScript) -> Self {
        Self::new(name, Behavior::Sync(Box::new(script)))
    }

    /// Wrap a script executed as a micro-thread
    pub fn from_async(name: impl Into<String>, script: impl AsyncScript) -> Self {
        let script: Box<dyn AsyncScript> = Box::new(script);
        Self::new(name, Behavior::Async(Rc::new(RefCell::new(script))))
    }

    pub fn with_priority(self, priority: i32) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn with_type_name(self, type_name: impl Into<String>) -> Self {
        self.set_type_name(type_name);
        self
    }

    pub fn id(&self) -> ScriptId {
        self.inner.id
    }

    /// Name used to identify the script in logs and events
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registry key the script was built from, if any
    pub fn type_name(&self) -> Option<String> {
        self.inner.type_name.borrow().clone()
    }

    pub fn set_type_name(&self, type_name: impl Into<String>) {
        *self.inner.type_name.borrow_mut() = Some(type_name.into());
    }

    pub fn kind(&self) -> ScriptKind {
        self.inner.kind
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority.get()
    }

    /// Change the priority
    ///
    /// Takes effect for the next start and update ordering. An async script's
    /// running micro-thread follows the new priority.
    pub fn set_priority(&self, priority: i32) {
        self.inner.priority.set(priority);
        if let Some(thread) = self.micro_thread() {
            thread.set_priority(priority);
        }
    }

    /// Set between a live reload and the first start of the new instance
    pub fn is_live_reloading(&self) -> bool {
        self.inner.is_live_reloading.get()
    }

    pub(crate) fn set_live_reloading(&self, value: bool) {
        self.inner.is_live_reloading.set(value);
    }

    pub fn state(&self) -> ScriptState {
        self.inner.state.get()
    }

    pub(crate) fn set_state(&self, state: ScriptState) {
        self.inner.state.set(state);
    }

    /// Entity whose component holds this script
    pub fn owner(&self) -> Option<EntityId> {
        self.inner.owner.get()
    }

    pub(crate) fn set_owner(&self, owner: Option<EntityId>) {
        self.inner.owner.set(owner);
    }

    /// Micro-thread running an async script's body, while it is alive
    pub fn micro_thread(&self) -> Option<MicroThread> {
        self.inner.micro_thread.borrow().upgrade()
    }

    pub(crate) fn set_micro_thread(&self, thread: Option<&MicroThread>) {
        *self.inner.micro_thread.borrow_mut() = thread
            .map(MicroThread::downgrade)
            .unwrap_or_default();
    }

    pub(crate) fn behavior(&self) -> &RefCell<Behavior> {
        &self.inner.behavior
    }
}

impl PartialEq for Script {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Script {}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}
