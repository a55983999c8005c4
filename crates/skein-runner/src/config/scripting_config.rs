use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptingConfig {
    /// Let script faults abort the frame instead of deregistering the script
    #[serde(default)]
    pub propagate_exceptions: bool,

    /// Rebuild scripts from the registry on SIGUSR2 (default: true)
    #[serde(default = "default_live_reload")]
    pub live_reload: bool,

    /// Entities spawned at startup, with the scripts attached to each
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
}

fn default_live_reload() -> bool {
    true
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            propagate_exceptions: false,
            live_reload: true,
            entities: Vec::new(),
        }
    }
}

impl ScriptingConfig {
    /// Total number of script entries across all entities
    pub fn script_count(&self) -> usize {
        self.entities.iter().map(|e| e.scripts.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub id: u64,

    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEntry {
    /// Registered script type to instantiate
    #[serde(rename = "type")]
    pub type_name: String,

    /// Instance name (defaults to the type name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub priority: i32,
}

impl ScriptEntry {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            name: None,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_uses_type_key() {
        let entity: EntityConfig = toml::from_str(
            r#"
            id = 3

            [[scripts]]
            type = "spinner"
            priority = -5

            [[scripts]]
            type = "greeter"
            name = "hello"
            "#,
        )
        .unwrap();

        assert_eq!(entity.id, 3);
        assert_eq!(entity.scripts[0].type_name, "spinner");
        assert_eq!(entity.scripts[0].priority, -5);
        assert_eq!(entity.scripts[0].instance_name(), "spinner");
        assert_eq!(entity.scripts[1].instance_name(), "hello");
        assert_eq!(entity.scripts[1].priority, 0);
    }

    #[test]
    fn test_defaults() {
        let config: ScriptingConfig = toml::from_str("").unwrap();
        assert!(!config.propagate_exceptions);
        assert!(config.live_reload);
        assert_eq!(config.script_count(), 0);
    }
}
