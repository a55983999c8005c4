//! Cooperative micro-threads for the simulation thread
//!
//! A [`MicroThread`] is a unit of work multiplexed onto the single thread
//! that drives the simulation. Its body is an ordinary Rust future; the
//! [`Scheduler`] polls every runnable micro-thread once per [`Scheduler::run`]
//! call, ordered by priority (lower first) and then by scheduling order.
//!
//! Suspension points are explicit:
//! - [`Scheduler::next_frame`] parks the caller until the next `run()`
//! - [`Scheduler::when_all`] parks the caller until a set of micro-threads end
//! - [`Scheduler::yield_now`] lets the rest of the current `run()` go first
//!
//! Any other future may be awaited as well; its waker re-queues the
//! micro-thread, even when woken from another OS thread.
//!
//! Everything here is `!Send`: a scheduler and its micro-threads stay on the
//! thread that created them.

mod awaiters;
mod error;
mod micro_thread;
mod scheduler;
mod waker;

pub use awaiters::{NextFrame, WhenAll, YieldNow};
pub use error::{Fault, SchedulerError};
pub use micro_thread::{
    MicroThread, MicroThreadFlags, MicroThreadId, MicroThreadState, ScheduleMode, WeakMicroThread,
};
pub use scheduler::{MAX_PENDING_FAULTS, MicroThreadFault, Scheduler};

/// Result type returned by micro-thread bodies
pub type BodyResult = anyhow::Result<()>;
