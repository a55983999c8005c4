use std::{fs, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{default_config_path, scripting_config::ScriptingConfig};

#[derive(Debug)]
pub enum ConfigLoadError {
    NotFound(PathBuf),
    NoConfigDir,
    ParseError(String),
    IoError(String),
}

impl std::fmt::Display for ConfigLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigLoadError::NotFound(path) => {
                write!(f, "Config file not found: {}", path.display())
            }
            ConfigLoadError::NoConfigDir => write!(f, "Failed to determine config directory"),
            ConfigLoadError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigLoadError::IoError(msg) => write!(f, "IO error reading config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigLoadError {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkeinConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Scripting configuration
    #[serde(default)]
    pub scripting: ScriptingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Target frames per second (default: 60)
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Stop after this many frames; runs until shutdown when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<u64>,
}

fn default_fps() -> u32 {
    60
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            max_frames: None,
        }
    }
}

impl SimulationConfig {
    /// Duration of one frame at the configured rate
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps.max(1)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to a file in the data directory
    #[serde(default)]
    pub file: bool,
}

impl SkeinConfig {
    pub fn config_path() -> Result<PathBuf, ConfigLoadError> {
        default_config_path().ok_or(ConfigLoadError::NoConfigDir)
    }

    /// Load from the default config location
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound(path.to_path_buf()));
        }

        let content =
            fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config =
            toml::from_str(&content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&self)?;
        fs::write(path, content)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityConfig, ScriptEntry};

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = SkeinConfig::default();
        config.simulation.fps = 30;
        config.simulation.max_frames = Some(120);
        config.scripting.propagate_exceptions = true;
        config.scripting.entities.push(EntityConfig {
            id: 1,
            scripts: vec![ScriptEntry::new("spinner").with_priority(-1)],
        });

        config.save_to(&path).unwrap();
        let loaded = SkeinConfig::load_from(&path).unwrap();

        assert_eq!(loaded.simulation.fps, 30);
        assert_eq!(loaded.simulation.max_frames, Some(120));
        assert!(loaded.scripting.propagate_exceptions);
        assert_eq!(loaded.scripting.entities, config.scripting.entities);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SkeinConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound(_)));
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"[simulation]\nfps = \"fast\"\n").unwrap();

        let err = SkeinConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: SkeinConfig = toml::from_str("").unwrap();
        assert_eq!(config.simulation.fps, 60);
        assert!(config.simulation.max_frames.is_none());
        assert!(!config.logging.file);
        assert!(config.scripting.live_reload);
    }

    #[test]
    fn test_frame_duration() {
        let simulation = SimulationConfig {
            fps: 50,
            max_frames: None,
        };
        assert_eq!(simulation.frame_duration(), Duration::from_millis(20));
    }
}
