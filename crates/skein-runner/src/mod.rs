pub mod config;
mod event_consumer;
mod game_system;
pub mod logging;
mod reload;
mod script_host;
mod simulation;

pub use config::{
    ConfigLoadError, EntityConfig, LoggingConfig, ScriptEntry, ScriptingConfig, SimulationConfig,
    SkeinConfig,
};
pub use event_consumer::LoggingConsumer;
pub use game_system::{FnSystem, GameSystem, update_order};
pub use logging::init_logging;
pub use reload::{ReloadSignal, setup_reload_signal};
pub use script_host::ScriptHost;
pub use simulation::{BuildError, RunnerError, Simulation, SimulationBuilder};
