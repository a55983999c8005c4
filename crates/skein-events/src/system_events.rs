#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEvent {
    /// Reload scripts (SIGUSR2 or another live-reload trigger)
    ReloadScripts,
    /// A frame of the host loop finished
    FrameCompleted { frame: u64, elapsed_micros: u64 },
    /// System shutdown requested
    Shutdown,
}
