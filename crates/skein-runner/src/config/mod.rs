pub mod scripting_config;
pub mod skein_config;

pub use scripting_config::{EntityConfig, ScriptEntry, ScriptingConfig};
pub use skein_config::{ConfigLoadError, LoggingConfig, SimulationConfig, SkeinConfig};

use std::path::PathBuf;

use directories::ProjectDirs;

/// Project directories for skein, or `None` when no home directory is known
pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "skein")
}

/// Default location of the config file
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}
