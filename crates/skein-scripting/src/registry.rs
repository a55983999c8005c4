use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::script::Script;

type ScriptFactory = Box<dyn Fn(&str) -> Script>;

/// Named script factories
///
/// Config files refer to scripts by type name, and live reload uses the
/// same names to build a fresh instance of a running script.
#[derive(Default)]
pub struct ScriptRegistry {
    factories: BTreeMap<String, ScriptFactory>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; it receives the instance name to give the script
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Script + 'static,
    {
        let type_name = type_name.into();
        debug!(target: "scripting", "Registering script type: {}", type_name);
        self.factories.insert(type_name, Box::new(factory));
    }

    /// Build a new script of the given type
    pub fn create(&self, type_name: &str, name: &str) -> Option<Script> {
        let factory = self.factories.get(type_name)?;
        Some(factory(name).with_type_name(type_name))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("types", &self.type_names().collect::<Vec<_>>())
            .finish()
    }
}
