/// Types of script-related events
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ScriptEventType {
    /// Registered with the script system, waiting for its first start
    Added,
    /// `start` ran (or the async body was spawned)
    Started,
    /// Unregistered by the host
    Removed,
    /// The cancellation hook ran for a script removed after starting
    Cancelled,
    /// User code failed; the script was deregistered unless exceptions propagate
    Faulted { message: String },
    /// Marked as taking part in a live reload
    LiveReloaded,
    /// Message logged by the script itself
    Log { message: String },
}

/// Lifecycle event for one script instance
#[derive(Debug, Clone)]
pub struct ScriptEvent {
    pub script_id: u64,
    pub script_name: String,
    pub event_type: ScriptEventType,
}

impl ScriptEvent {
    pub fn new(script_id: u64, script_name: impl Into<String>, event_type: ScriptEventType) -> Self {
        Self {
            script_id,
            script_name: script_name.into(),
            event_type,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self.event_type, ScriptEventType::Faulted { .. })
    }
}
