use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

use bitflags::bitflags;
use futures::FutureExt;
use futures::future::LocalBoxFuture;

use crate::error::{Fault, SchedulerError};
use crate::scheduler::{Scheduler, SchedulerInner};
use crate::BodyResult;

static NEXT_MICRO_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identifier of a micro-thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MicroThreadId(u64);

impl MicroThreadId {
    fn next() -> Self {
        MicroThreadId(NEXT_MICRO_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        MicroThreadId(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MicroThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// Per micro-thread behaviour switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MicroThreadFlags: u32 {
        /// A fault in this micro-thread is never returned from `Scheduler::run`,
        /// even when exception propagation is enabled
        const IGNORE_EXCEPTIONS = 0x1;
    }
}

/// Lifecycle state of a micro-thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MicroThreadState {
    /// Created through `Scheduler::create`, no body yet
    Created,
    /// Body attached and queued, not dispatched yet
    Starting,
    /// Currently being polled
    Running,
    /// Queued again after a yield or a wake-up
    Ready,
    /// Parked until the next `Scheduler::run`
    WaitingForFrame,
    /// Parked until a set of micro-threads end
    WaitingForChildren,
    /// Parked on a future the scheduler does not know about
    Waiting,
    Completed,
    Faulted,
    Cancelled,
}

impl MicroThreadState {
    /// Completed, faulted and cancelled micro-threads never run again
    pub fn is_over(self) -> bool {
        matches!(
            self,
            MicroThreadState::Completed | MicroThreadState::Faulted | MicroThreadState::Cancelled
        )
    }
}

/// Where a newly scheduled micro-thread lands among equal priorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    /// Ahead of everything already queued with the same priority
    First,
    /// Behind everything already queued with the same priority
    #[default]
    Last,
}

pub(crate) type Body = Box<dyn FnOnce() -> LocalBoxFuture<'static, BodyResult>>;

pub(crate) struct MicroThreadInner {
    pub(crate) id: MicroThreadId,
    pub(crate) scheduler: Weak<SchedulerInner>,
    pub(crate) flags: MicroThreadFlags,
    pub(crate) name: RefCell<Option<String>>,
    pub(crate) priority: Cell<i32>,
    pub(crate) state: Cell<MicroThreadState>,
    pub(crate) body: RefCell<Option<Body>>,
    pub(crate) future: RefCell<Option<LocalBoxFuture<'static, BodyResult>>>,
    pub(crate) fault: RefCell<Option<Rc<Fault>>>,
    pub(crate) cancel_requested: Cell<bool>,
    /// `(priority, counter)` of the live run-queue entry, if queued
    pub(crate) queued: Cell<Option<(i32, i64)>>,
    /// Wakers of whoever awaits completion, tagged with the awaiting
    /// micro-thread when there is one
    pub(crate) completion_wakers: RefCell<Vec<(Option<MicroThreadId>, Waker)>>,
    pub(crate) waker: RefCell<Option<Waker>>,
}

/// Handle to a cooperatively scheduled unit of work
///
/// Handles are cheap to clone. The owning [`Scheduler`] keeps a handle for as
/// long as the micro-thread is alive; anything else that only needs to
/// observe or cancel it should hold a [`WeakMicroThread`].
#[derive(Clone)]
pub struct MicroThread {
    pub(crate) inner: Rc<MicroThreadInner>,
}

impl MicroThread {
    pub(crate) fn new(scheduler: Weak<SchedulerInner>, flags: MicroThreadFlags) -> Self {
        Self {
            inner: Rc::new(MicroThreadInner {
                id: MicroThreadId::next(),
                scheduler,
                flags,
                name: RefCell::new(None),
                priority: Cell::new(0),
                state: Cell::new(MicroThreadState::Created),
                body: RefCell::new(None),
                future: RefCell::new(None),
                fault: RefCell::new(None),
                cancel_requested: Cell::new(false),
                queued: Cell::new(None),
                completion_wakers: RefCell::new(Vec::new()),
                waker: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> MicroThreadId {
        self.inner.id
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.borrow().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.borrow_mut() = Some(name.into());
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority.get()
    }

    /// Change the priority
    ///
    /// The run queue orders by the priority a micro-thread had when it was
    /// queued. If this one is currently queued it is re-queued under the new
    /// priority, keeping its place among equal priorities.
    pub fn set_priority(&self, priority: i32) {
        if self.inner.priority.replace(priority) == priority {
            return;
        }

        if let Some((_, counter)) = self.inner.queued.get()
            && let Some(scheduler) = self.scheduler()
        {
            scheduler.requeue(self, priority, counter);
        }
    }

    pub fn state(&self) -> MicroThreadState {
        self.inner.state.get()
    }

    pub(crate) fn set_state(&self, state: MicroThreadState) {
        self.inner.state.set(state);
    }

    pub fn flags(&self) -> MicroThreadFlags {
        self.inner.flags
    }

    pub fn is_over(&self) -> bool {
        self.state().is_over()
    }

    /// The fault recorded when the body failed
    pub fn fault(&self) -> Option<Rc<Fault>> {
        self.inner.fault.borrow().clone()
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.cancel_requested.get()
    }

    /// Scheduler owning this micro-thread, if it is still alive
    pub fn scheduler(&self) -> Option<Scheduler> {
        self.inner.scheduler.upgrade().map(Scheduler::from_inner)
    }

    pub fn downgrade(&self) -> WeakMicroThread {
        WeakMicroThread {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Attach a body and queue the micro-thread behind equal priorities
    pub fn start<F, Fut>(&self, body: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = BodyResult> + 'static,
    {
        self.start_with_mode(body, ScheduleMode::Last)
    }

    /// Attach a body and queue the micro-thread
    ///
    /// Neither `body` nor the future it returns runs before the next
    /// dispatch by [`Scheduler::run`].
    pub fn start_with_mode<F, Fut>(&self, body: F, mode: ScheduleMode) -> Result<(), SchedulerError>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = BodyResult> + 'static,
    {
        if self.state() != MicroThreadState::Created {
            return Err(SchedulerError::AlreadyStarted(self.id()));
        }
        let scheduler = self
            .scheduler()
            .ok_or(SchedulerError::SchedulerDropped(self.id()))?;

        let body: Body = Box::new(move || body().boxed_local());
        *self.inner.body.borrow_mut() = Some(body);
        self.set_state(MicroThreadState::Starting);

        scheduler.register(self);
        scheduler.schedule(self, mode);
        Ok(())
    }

    /// Request cooperative cancellation
    ///
    /// The body is not interrupted: the next time the scheduler would resume
    /// it, its future is dropped instead and the micro-thread ends as
    /// `Cancelled`. Awaiters see [`SchedulerError::Cancelled`].
    pub fn cancel(&self) {
        if self.is_over() || self.inner.cancel_requested.replace(true) {
            return;
        }

        if self.state() == MicroThreadState::Created {
            self.set_state(MicroThreadState::Cancelled);
            return;
        }

        if let Some(scheduler) = self.scheduler() {
            scheduler.schedule(self, ScheduleMode::First);
        }
    }

    pub(crate) fn add_completion_waker(&self, awaiter: Option<MicroThreadId>, waker: &Waker) {
        let mut wakers = self.inner.completion_wakers.borrow_mut();
        if !wakers.iter().any(|(_, existing)| existing.will_wake(waker)) {
            wakers.push((awaiter, waker.clone()));
        }
    }

    pub(crate) fn remove_completion_waker(&self, waker: &Waker) {
        self.inner
            .completion_wakers
            .borrow_mut()
            .retain(|(_, existing)| !existing.will_wake(waker));
    }

    /// Whether anyone still alive is waiting for this micro-thread to end
    ///
    /// Waiters that are not micro-threads always count. A micro-thread waiter
    /// counts while it is registered with `scheduler` and not being cancelled.
    pub(crate) fn has_live_completion_waiters(&self, scheduler: &Scheduler) -> bool {
        self.inner
            .completion_wakers
            .borrow()
            .iter()
            .any(|(awaiter, _)| match awaiter {
                None => true,
                Some(id) => scheduler
                    .live_micro_thread(*id)
                    .is_some_and(|t| !t.is_over() && !t.is_cancellation_requested()),
            })
    }

    /// Error an awaiter receives for this micro-thread, if it did not complete
    pub(crate) fn termination_error(&self) -> Option<SchedulerError> {
        match self.state() {
            MicroThreadState::Faulted => self.fault().map(|fault| SchedulerError::Faulted {
                id: self.id(),
                name: self.name(),
                fault,
            }),
            MicroThreadState::Cancelled => Some(SchedulerError::Cancelled {
                id: self.id(),
                name: self.name(),
            }),
            _ => None,
        }
    }
}

impl PartialEq for MicroThread {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for MicroThread {}

impl fmt::Debug for MicroThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroThread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("priority", &self.priority())
            .field("state", &self.state())
            .finish()
    }
}

/// Non-owning handle to a micro-thread
#[derive(Clone, Default)]
pub struct WeakMicroThread {
    inner: Weak<MicroThreadInner>,
}

impl WeakMicroThread {
    pub fn upgrade(&self) -> Option<MicroThread> {
        self.inner.upgrade().map(|inner| MicroThread { inner })
    }
}

impl fmt::Debug for WeakMicroThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(thread) => write!(f, "WeakMicroThread({})", thread.id()),
            None => write!(f, "WeakMicroThread(dropped)"),
        }
    }
}
