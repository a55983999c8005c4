use std::any::Any;
use std::rc::Rc;

use crate::MicroThreadId;

/// Why a micro-thread body failed
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    /// The body returned an error
    #[error("{0:#}")]
    Error(anyhow::Error),
    /// The body panicked
    #[error("panicked: {0}")]
    Panic(String),
}

impl Fault {
    /// Build a fault out of a `catch_unwind` payload
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Fault::Panic(message)
    }

    /// Look at the original error raised by the body, if it was an `E`
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Fault::Error(error) => error.downcast_ref::<E>(),
            Fault::Panic(_) => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Fault::Panic(_))
    }
}

/// Errors surfaced by the scheduler
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("micro-thread {id} ({}) faulted: {fault}", .name.as_deref().unwrap_or("unnamed"))]
    Faulted {
        id: MicroThreadId,
        name: Option<String>,
        fault: Rc<Fault>,
    },

    #[error("micro-thread {id} ({}) was cancelled", .name.as_deref().unwrap_or("unnamed"))]
    Cancelled {
        id: MicroThreadId,
        name: Option<String>,
    },

    #[error("Scheduler::run called re-entrantly from inside micro-thread {0}")]
    ReentrantRun(MicroThreadId),

    #[error("micro-thread {0} was already started")]
    AlreadyStarted(MicroThreadId),

    #[error("the scheduler owning micro-thread {0} was dropped")]
    SchedulerDropped(MicroThreadId),
}

impl SchedulerError {
    /// The fault carried by a `Faulted` error
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            SchedulerError::Faulted { fault, .. } => Some(fault.as_ref()),
            _ => None,
        }
    }

    /// Id of the micro-thread this error is about
    pub fn micro_thread_id(&self) -> MicroThreadId {
        match self {
            SchedulerError::Faulted { id, .. }
            | SchedulerError::Cancelled { id, .. }
            | SchedulerError::ReentrantRun(id)
            | SchedulerError::AlreadyStarted(id)
            | SchedulerError::SchedulerDropped(id) => *id,
        }
    }
}
