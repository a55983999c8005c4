use std::sync::{Arc, Mutex};
use std::task::Waker;

use futures::task::{ArcWake, waker};

use crate::MicroThreadId;

/// Ids of micro-threads woken since the scheduler last looked
///
/// Wakers have to be `Send + Sync`, so this is the one place the scheduler
/// shares state behind a lock. The scheduler drains it from its own thread.
#[derive(Debug, Default)]
pub(crate) struct WakeQueue {
    ids: Mutex<Vec<MicroThreadId>>,
}

impl WakeQueue {
    pub(crate) fn push(&self, id: MicroThreadId) {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        ids.push(id);
    }

    pub(crate) fn drain(&self) -> Vec<MicroThreadId> {
        let mut ids = self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *ids)
    }

    pub(crate) fn clear(&self) {
        self.drain();
    }
}

struct MicroThreadWaker {
    id: MicroThreadId,
    queue: Arc<WakeQueue>,
}

impl ArcWake for MicroThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(arc_self.id);
    }
}

/// Create the waker handed to a micro-thread's body when it is polled
pub(crate) fn micro_thread_waker(id: MicroThreadId, queue: Arc<WakeQueue>) -> Waker {
    waker(Arc::new(MicroThreadWaker { id, queue }))
}
