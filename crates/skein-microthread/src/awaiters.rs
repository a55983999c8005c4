use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::error::SchedulerError;
use crate::micro_thread::{MicroThread, MicroThreadState};
use crate::scheduler::Scheduler;

/// Future returned by [`Scheduler::next_frame`]
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct NextFrame {
    scheduler: Scheduler,
    target: Option<u64>,
}

impl NextFrame {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            target: None,
        }
    }
}

impl Future for NextFrame {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let frame = self.scheduler.frame();
        let target = *self.target.get_or_insert(frame + 1);

        if frame >= target {
            return Poll::Ready(());
        }

        self.scheduler.park_until_next_frame(cx.waker());
        Poll::Pending
    }
}

/// Future returned by [`Scheduler::when_all`]
///
/// Resolves once every micro-thread is over. The result is the error of the
/// first micro-thread, in argument order, that faulted or was cancelled.
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct WhenAll {
    scheduler: Scheduler,
    threads: Vec<MicroThread>,
    registered: Option<Waker>,
}

impl WhenAll {
    pub(crate) fn new(scheduler: Scheduler, threads: Vec<MicroThread>) -> Self {
        Self {
            scheduler,
            threads,
            registered: None,
        }
    }
}

impl Future for WhenAll {
    type Output = Result<(), SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let pending: Vec<MicroThread> = self
            .threads
            .iter()
            .filter(|t| !t.is_over())
            .cloned()
            .collect();

        if pending.is_empty() {
            self.registered = None;
            let first_error = self.threads.iter().find_map(MicroThread::termination_error);
            return Poll::Ready(first_error.map_or(Ok(()), Err));
        }

        let awaiter = self.scheduler.running_micro_thread().map(|t| t.id());
        for thread in &pending {
            thread.add_completion_waker(awaiter, cx.waker());
        }
        self.registered = Some(cx.waker().clone());
        self.scheduler
            .set_running_state(MicroThreadState::WaitingForChildren);
        Poll::Pending
    }
}

impl Drop for WhenAll {
    fn drop(&mut self) {
        // Dropped before resolving: the awaiter is gone.
        if let Some(waker) = self.registered.take() {
            for thread in self.threads.iter().filter(|t| !t.is_over()) {
                thread.remove_completion_waker(&waker);
            }
        }
    }
}

/// Future returned by [`Scheduler::yield_now`]
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct YieldNow {
    scheduler: Scheduler,
    yielded: bool,
}

impl YieldNow {
    pub(crate) fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            yielded: false,
        }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            return Poll::Ready(());
        }

        self.yielded = true;
        self.scheduler.set_running_state(MicroThreadState::Ready);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
