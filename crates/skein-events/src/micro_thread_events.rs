/// Types of micro-thread lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum MicroThreadEventType {
    /// First dispatch of the body
    Started,
    /// Body returned successfully
    Completed,
    /// Body returned an error or panicked
    Faulted { message: String },
    /// Cancellation was observed before the body finished
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MicroThreadEvent {
    pub id: u64,
    pub name: Option<String>,
    pub event_type: MicroThreadEventType,
}

impl MicroThreadEvent {
    pub fn new(id: u64, name: Option<String>, event_type: MicroThreadEventType) -> Self {
        Self {
            id,
            name,
            event_type,
        }
    }
}
