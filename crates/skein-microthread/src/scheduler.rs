use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use skein_events::{
    EventEmitter, EventSource, EventType, MicroThreadEvent, MicroThreadEventType, SharedConsumer,
};
use tracing::{debug, error, trace, warn};

use crate::awaiters::{NextFrame, WhenAll, YieldNow};
use crate::error::{Fault, SchedulerError};
use crate::micro_thread::{
    MicroThread, MicroThreadFlags, MicroThreadId, MicroThreadState, ScheduleMode,
};
use crate::waker::{WakeQueue, micro_thread_waker};
use crate::BodyResult;

/// Run-queue entry; ordered by priority, then by scheduling counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    priority: i32,
    counter: i64,
    id: MicroThreadId,
}

/// Faults kept between two [`Scheduler::take_faults`] calls; older ones are
/// dropped first
pub const MAX_PENDING_FAULTS: usize = 256;

/// A fault raised by a micro-thread during `run()`
///
/// The scheduler keeps up to [`MAX_PENDING_FAULTS`] of these until its owner
/// collects them with [`Scheduler::take_faults`], so the owner can map a
/// failed micro-thread back to whatever spawned it.
#[derive(Debug, Clone)]
pub struct MicroThreadFault {
    pub id: MicroThreadId,
    pub name: Option<String>,
    pub fault: Rc<Fault>,
}

pub(crate) struct SchedulerInner {
    threads: RefCell<BTreeMap<MicroThreadId, MicroThread>>,
    queue: RefCell<BinaryHeap<Reverse<QueueEntry>>>,
    counter: Cell<i64>,
    frame: Cell<u64>,
    frame_waiters: RefCell<Vec<Waker>>,
    woken: Arc<WakeQueue>,
    running: RefCell<Option<MicroThread>>,
    propagate_exceptions: Cell<bool>,
    faults: RefCell<VecDeque<MicroThreadFault>>,
    events: RefCell<EventEmitter>,
}

/// Drives a group of cooperating micro-threads
///
/// `Scheduler` is a cheap handle; clones share the same state. Micro-thread
/// bodies usually capture a clone to reach [`next_frame`](Self::next_frame)
/// and friends.
///
/// # Misuse
///
/// The type is `!Send`, so it cannot be driven from another thread. Calling
/// [`run`](Self::run) from inside a micro-thread body is refused with
/// [`SchedulerError::ReentrantRun`].
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

impl Scheduler {
    /// Create a new scheduler without a diagnostics consumer
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                threads: RefCell::new(BTreeMap::new()),
                queue: RefCell::new(BinaryHeap::new()),
                counter: Cell::new(0),
                frame: Cell::new(0),
                frame_waiters: RefCell::new(Vec::new()),
                woken: Arc::new(WakeQueue::default()),
                running: RefCell::new(None),
                propagate_exceptions: Cell::new(false),
                faults: RefCell::new(VecDeque::new()),
                events: RefCell::new(EventEmitter::default()),
            }),
        }
    }

    /// Create a new scheduler reporting to `consumer`
    pub fn with_consumer(consumer: SharedConsumer) -> Self {
        let scheduler = Self::new();
        scheduler.set_consumer(Some(consumer));
        scheduler
    }

    pub(crate) fn from_inner(inner: Rc<SchedulerInner>) -> Self {
        Self { inner }
    }

    pub fn set_consumer(&self, consumer: Option<SharedConsumer>) {
        self.inner.events.borrow_mut().set_consumer(consumer);
    }

    /// Whether a fault nobody awaits is returned from [`run`](Self::run)
    pub fn propagate_exceptions(&self) -> bool {
        self.inner.propagate_exceptions.get()
    }

    pub fn set_propagate_exceptions(&self, propagate: bool) {
        self.inner.propagate_exceptions.set(propagate);
    }

    /// Number of `run()` calls so far
    pub fn frame(&self) -> u64 {
        self.inner.frame.get()
    }

    /// Micro-thread currently being polled, when called from inside a body
    pub fn running_micro_thread(&self) -> Option<MicroThread> {
        self.inner.running.borrow().clone()
    }

    /// Every started micro-thread that has not ended, in creation order
    pub fn micro_threads(&self) -> Vec<MicroThread> {
        self.inner.threads.borrow().values().cloned().collect()
    }

    pub fn micro_thread_count(&self) -> usize {
        self.inner.threads.borrow().len()
    }

    /// Faults raised since the last call, oldest first
    ///
    /// Owners that never drain this only lose the oldest faults past
    /// [`MAX_PENDING_FAULTS`].
    pub fn take_faults(&self) -> Vec<MicroThreadFault> {
        self.inner.faults.borrow_mut().drain(..).collect()
    }

    pub(crate) fn live_micro_thread(&self, id: MicroThreadId) -> Option<MicroThread> {
        self.inner.threads.borrow().get(&id).cloned()
    }

    // ===== Spawning =====

    /// Create a micro-thread whose body runs during a later [`run`](Self::run)
    pub fn add<F, Fut>(&self, body: F) -> MicroThread
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = BodyResult> + 'static,
    {
        self.add_with_flags(MicroThreadFlags::empty(), body)
    }

    pub fn add_with_flags<F, Fut>(&self, flags: MicroThreadFlags, body: F) -> MicroThread
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = BodyResult> + 'static,
    {
        let thread = self.create_with_flags(flags);
        // A fresh micro-thread belongs to this live scheduler, so starting
        // it cannot fail.
        if let Err(e) = thread.start(body) {
            error!(target: "scheduler", "Failed to start micro-thread {}: {}", thread.id(), e);
        }
        thread
    }

    /// Create an empty micro-thread, to be started with [`MicroThread::start`]
    ///
    /// Useful to set a name or priority before the body is queued.
    pub fn create(&self) -> MicroThread {
        self.create_with_flags(MicroThreadFlags::empty())
    }

    pub fn create_with_flags(&self, flags: MicroThreadFlags) -> MicroThread {
        MicroThread::new(Rc::downgrade(&self.inner), flags)
    }

    // ===== Suspension points =====

    /// Suspend the calling micro-thread until the next [`run`](Self::run)
    ///
    /// Must be awaited from a body driven by this scheduler.
    pub fn next_frame(&self) -> NextFrame {
        NextFrame::new(self.clone())
    }

    /// Suspend until every micro-thread in `threads` has ended
    ///
    /// Resolves to the first failure in argument order once all of them are
    /// over. Waiting on a micro-thread that was created but never started
    /// never resolves.
    pub fn when_all<I>(&self, threads: I) -> WhenAll
    where
        I: IntoIterator<Item = MicroThread>,
    {
        WhenAll::new(self.clone(), threads.into_iter().collect())
    }

    /// Let every other runnable micro-thread of the same priority go first
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new(self.clone())
    }

    // ===== Running =====

    /// Advance the scheduler by one tick
    ///
    /// Every queued micro-thread is polled, lowest priority value first and in
    /// scheduling order among equals. Micro-threads woken during the tick
    /// (yield, completion of awaited threads, foreign wakers) run in the same
    /// tick; those parked on [`next_frame`](Self::next_frame) do not.
    pub fn run(&self) -> Result<(), SchedulerError> {
        if let Some(running) = self.inner.running.borrow().as_ref() {
            error!(target: "scheduler", "Scheduler::run called from inside micro-thread {}", running.id());
            return Err(SchedulerError::ReentrantRun(running.id()));
        }

        let frame = self.inner.frame.get() + 1;
        self.inner.frame.set(frame);
        trace!(target: "scheduler", "Running frame {}", frame);

        let result = self.run_queue();

        // Parked on next_frame during this tick: queued for the next one.
        let frame_waiters = std::mem::take(&mut *self.inner.frame_waiters.borrow_mut());
        for waker in frame_waiters {
            waker.wake();
        }
        self.drain_woken();

        result
    }

    fn run_queue(&self) -> Result<(), SchedulerError> {
        loop {
            self.drain_woken();
            let Some(thread) = self.pop_next() else {
                return Ok(());
            };
            self.dispatch(thread)?;
        }
    }

    /// Drop every micro-thread without running it again
    ///
    /// Bodies that captured a clone of this scheduler keep it alive, so the
    /// owner calls this when it shuts down.
    pub fn clear(&self) {
        let threads: Vec<MicroThread> = std::mem::take(&mut *self.inner.threads.borrow_mut())
            .into_values()
            .collect();
        self.inner.queue.borrow_mut().clear();
        self.inner.frame_waiters.borrow_mut().clear();
        self.inner.woken.clear();

        if !threads.is_empty() {
            debug!(target: "scheduler", "Clearing {} micro-thread(s)", threads.len());
        }

        for thread in threads {
            thread.set_state(MicroThreadState::Cancelled);
            thread.inner.queued.set(None);
            thread.inner.completion_wakers.borrow_mut().clear();
            let future = thread.inner.future.borrow_mut().take();
            let body = thread.inner.body.borrow_mut().take();
            drop(future);
            drop(body);
        }
    }

    // ===== Queue management =====

    pub(crate) fn register(&self, thread: &MicroThread) {
        self.inner
            .threads
            .borrow_mut()
            .insert(thread.id(), thread.clone());
    }

    pub(crate) fn schedule(&self, thread: &MicroThread, mode: ScheduleMode) {
        if thread.is_over() || !self.inner.threads.borrow().contains_key(&thread.id()) {
            return;
        }
        if thread.inner.queued.get().is_some() && mode == ScheduleMode::Last {
            return;
        }

        let next = self.inner.counter.get() + 1;
        self.inner.counter.set(next);
        let counter = match mode {
            ScheduleMode::First => -next,
            ScheduleMode::Last => next,
        };

        self.push(thread, thread.priority(), counter);
    }

    pub(crate) fn requeue(&self, thread: &MicroThread, priority: i32, counter: i64) {
        self.push(thread, priority, counter);
    }

    fn push(&self, thread: &MicroThread, priority: i32, counter: i64) {
        thread.inner.queued.set(Some((priority, counter)));
        self.inner.queue.borrow_mut().push(Reverse(QueueEntry {
            priority,
            counter,
            id: thread.id(),
        }));
    }

    fn pop_next(&self) -> Option<MicroThread> {
        loop {
            let Reverse(entry) = self.inner.queue.borrow_mut().pop()?;
            let thread = self.inner.threads.borrow().get(&entry.id).cloned();

            // Entries left behind by a priority change or a cancellation
            // no longer match the micro-thread's live queue key.
            match thread {
                Some(thread) if thread.inner.queued.get() == Some((entry.priority, entry.counter)) => {
                    thread.inner.queued.set(None);
                    return Some(thread);
                }
                _ => continue,
            }
        }
    }

    fn drain_woken(&self) {
        for id in self.inner.woken.drain() {
            let thread = self.inner.threads.borrow().get(&id).cloned();
            let Some(thread) = thread else {
                continue;
            };
            if !thread.is_over() && thread.inner.queued.get().is_none() {
                thread.set_state(MicroThreadState::Ready);
                self.schedule(&thread, ScheduleMode::Last);
            }
        }
    }

    fn waker_for(&self, thread: &MicroThread) -> Waker {
        thread
            .inner
            .waker
            .borrow_mut()
            .get_or_insert_with(|| micro_thread_waker(thread.id(), self.inner.woken.clone()))
            .clone()
    }

    pub(crate) fn park_until_next_frame(&self, waker: &Waker) {
        self.inner.frame_waiters.borrow_mut().push(waker.clone());
        self.set_running_state(MicroThreadState::WaitingForFrame);
    }

    pub(crate) fn set_running_state(&self, state: MicroThreadState) {
        if let Some(thread) = self.inner.running.borrow().as_ref() {
            thread.set_state(state);
        }
    }

    // ===== Dispatch =====

    fn dispatch(&self, thread: MicroThread) -> Result<(), SchedulerError> {
        if thread.is_over() {
            return Ok(());
        }

        if thread.is_cancellation_requested() {
            debug!(target: "scheduler", "Micro-thread {} cancelled", thread.id());
            self.finish(&thread, MicroThreadState::Cancelled);
            return Ok(());
        }

        if thread.state() == MicroThreadState::Starting {
            self.emit(&thread, MicroThreadEventType::Started);
        }

        let waker = self.waker_for(&thread);
        let mut cx = Context::from_waker(&waker);
        let body = thread.inner.body.borrow_mut().take();
        let mut future = thread.inner.future.borrow_mut().take();

        thread.set_state(MicroThreadState::Running);
        *self.inner.running.borrow_mut() = Some(thread.clone());

        let polled = panic::catch_unwind(AssertUnwindSafe(|| {
            if future.is_none()
                && let Some(body) = body
            {
                future = Some(body());
            }
            match future.as_mut() {
                Some(future) => future.as_mut().poll(&mut cx),
                None => Poll::Ready(Ok(())),
            }
        }));

        *self.inner.running.borrow_mut() = None;

        match polled {
            Ok(Poll::Pending) => {
                if thread.state() == MicroThreadState::Running {
                    thread.set_state(MicroThreadState::Waiting);
                }
                // The body may have cleared the scheduler while suspended.
                if !thread.is_over() {
                    *thread.inner.future.borrow_mut() = future;
                }
                Ok(())
            }
            Ok(Poll::Ready(Ok(()))) => {
                drop(future);
                self.finish(&thread, MicroThreadState::Completed);
                Ok(())
            }
            Ok(Poll::Ready(Err(e))) => {
                drop(future);
                self.fault(&thread, Fault::Error(e))
            }
            Err(payload) => {
                drop(future);
                self.fault(&thread, Fault::from_panic(payload))
            }
        }
    }

    fn fault(&self, thread: &MicroThread, fault: Fault) -> Result<(), SchedulerError> {
        error!(
            target: "scheduler",
            "Unexpected error while executing micro-thread {} ({}): {}",
            thread.id(),
            thread.name().as_deref().unwrap_or("unnamed"),
            fault
        );

        let fault = Rc::new(fault);
        *thread.inner.fault.borrow_mut() = Some(fault.clone());
        let awaited = thread.has_live_completion_waiters(self);

        {
            let mut faults = self.inner.faults.borrow_mut();
            if faults.len() >= MAX_PENDING_FAULTS
                && let Some(dropped) = faults.pop_front()
            {
                warn!(
                    target: "scheduler",
                    "Dropping fault of micro-thread {}: more than {} faults pending",
                    dropped.id,
                    MAX_PENDING_FAULTS
                );
            }
            faults.push_back(MicroThreadFault {
                id: thread.id(),
                name: thread.name(),
                fault: fault.clone(),
            });
        }
        self.finish(thread, MicroThreadState::Faulted);

        // Nobody is waiting on it: in propagation mode the caller of run()
        // gets the original fault.
        if self.propagate_exceptions()
            && !awaited
            && !thread.flags().contains(MicroThreadFlags::IGNORE_EXCEPTIONS)
        {
            return Err(SchedulerError::Faulted {
                id: thread.id(),
                name: thread.name(),
                fault,
            });
        }

        Ok(())
    }

    fn finish(&self, thread: &MicroThread, state: MicroThreadState) {
        thread.set_state(state);
        thread.inner.queued.set(None);
        thread.inner.future.borrow_mut().take();
        thread.inner.body.borrow_mut().take();
        self.inner.threads.borrow_mut().remove(&thread.id());

        let waiters = std::mem::take(&mut *thread.inner.completion_wakers.borrow_mut());
        for (_, waker) in waiters {
            waker.wake();
        }

        let event_type = match state {
            MicroThreadState::Faulted => MicroThreadEventType::Faulted {
                message: thread
                    .fault()
                    .map(|fault| fault.to_string())
                    .unwrap_or_default(),
            },
            MicroThreadState::Cancelled => MicroThreadEventType::Cancelled,
            _ => MicroThreadEventType::Completed,
        };
        self.emit(thread, event_type);
    }

    fn emit(&self, thread: &MicroThread, event_type: MicroThreadEventType) {
        let event = MicroThreadEvent::new(thread.id().as_u64(), thread.name(), event_type);
        self.inner.events.borrow_mut().emit(
            EventType::MicroThread(event),
            self.frame(),
            EventSource::Scheduler,
        );
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("frame", &self.frame())
            .field("micro_threads", &self.micro_thread_count())
            .field("propagate_exceptions", &self.propagate_exceptions())
            .finish()
    }
}
