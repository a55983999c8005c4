//! Entity glue: which scripts belong to which entity, and forwarding of
//! attach/detach and script list changes to the [`ScriptSystem`].

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::registry::ScriptRegistry;
use crate::script::Script;
use crate::script_system::{ScriptError, ScriptSystem};

/// Identifier of a simulation entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity:{}", self.0)
    }
}

#[derive(Debug, Clone)]
enum ScriptChange {
    Added(Script),
    Removed(Script),
    Replaced { old: Script, new: Script },
}

/// Ordered list of the scripts attached to one entity
///
/// Changes made while the entity is attached are recorded and forwarded to
/// the script system by [`ScriptProcessor::sync`].
#[derive(Debug, Default)]
pub struct ScriptComponent {
    scripts: Vec<Script>,
    changes: Vec<ScriptChange>,
}

impl ScriptComponent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, script: Script) -> Self {
        self.push(script);
        self
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// First script with the given name
    pub fn find(&self, name: &str) -> Option<&Script> {
        self.scripts.iter().find(|script| script.name() == name)
    }

    pub fn push(&mut self, script: Script) {
        self.scripts.push(script.clone());
        self.changes.push(ScriptChange::Added(script));
    }

    pub fn remove(&mut self, script: &Script) -> bool {
        let Some(index) = self.scripts.iter().position(|s| s == script) else {
            return false;
        };
        let script = self.scripts.remove(index);
        self.changes.push(ScriptChange::Removed(script));
        true
    }

    /// Swap `old` for `new` in place, as a live reload does
    pub fn replace(&mut self, old: &Script, new: Script) -> bool {
        let Some(slot) = self.scripts.iter_mut().find(|s| **s == *old) else {
            return false;
        };
        let old = std::mem::replace(slot, new.clone());
        self.changes.push(ScriptChange::Replaced { old, new });
        true
    }

    fn take_changes(&mut self) -> Vec<ScriptChange> {
        std::mem::take(&mut self.changes)
    }
}

/// Keeps the script system in step with the entities of the simulation
#[derive(Debug, Default)]
pub struct ScriptProcessor {
    entities: BTreeMap<EntityId, ScriptComponent>,
}

fn keep_first_error(first: &mut Option<ScriptError>, result: Result<(), ScriptError>) {
    if let Err(e) = result {
        first.get_or_insert(e);
    }
}

impl ScriptProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn component(&self, entity: EntityId) -> Option<&ScriptComponent> {
        self.entities.get(&entity)
    }

    /// Edit an attached entity's scripts; changes apply on the next
    /// [`sync`](Self::sync)
    pub fn component_mut(&mut self, entity: EntityId) -> Option<&mut ScriptComponent> {
        self.entities.get_mut(&entity)
    }

    /// Entity joined the simulation: register all of its scripts
    ///
    /// An entity that is already attached is detached first. If that fails
    /// the new component is still attached and the detach error is returned.
    pub fn attach(
        &mut self,
        entity: EntityId,
        mut component: ScriptComponent,
        system: &mut ScriptSystem,
    ) -> Result<(), ScriptError> {
        let mut detached = Ok(());
        if self.entities.contains_key(&entity) {
            warn!(target: "scripting", "{} is already attached, detaching it first", entity);
            detached = self.detach(entity, system).map(|_| ());
        }

        debug!(target: "scripting", "Attaching {} with {} script(s)", entity, component.len());
        component.take_changes();
        for script in component.scripts() {
            script.set_owner(Some(entity));
            system.add(script.clone());
        }

        self.entities.insert(entity, component);
        detached
    }

    /// Entity left the simulation: unregister all of its scripts
    ///
    /// Every script is removed even when one of them fails to cancel; the
    /// first failure is returned afterwards.
    pub fn detach(
        &mut self,
        entity: EntityId,
        system: &mut ScriptSystem,
    ) -> Result<Option<ScriptComponent>, ScriptError> {
        let Some(mut component) = self.entities.remove(&entity) else {
            return Ok(None);
        };

        debug!(target: "scripting", "Detaching {} with {} script(s)", entity, component.len());
        component.take_changes();
        let mut first_error = None;
        for script in component.scripts() {
            script.set_owner(None);
            keep_first_error(&mut first_error, system.remove(script));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Some(component)),
        }
    }

    /// Forward script list changes made since the last call
    ///
    /// Every change is applied even when removing a script fails; the first
    /// failure is returned afterwards.
    pub fn sync(&mut self, system: &mut ScriptSystem) -> Result<(), ScriptError> {
        let mut first_error = None;
        for (entity, component) in self.entities.iter_mut() {
            for change in component.take_changes() {
                match change {
                    ScriptChange::Added(script) => {
                        script.set_owner(Some(*entity));
                        system.add(script);
                    }
                    ScriptChange::Removed(script) => {
                        script.set_owner(None);
                        keep_first_error(&mut first_error, system.remove(&script));
                    }
                    ScriptChange::Replaced { old, new } => {
                        system.live_reload(&old, &new);
                        old.set_owner(None);
                        keep_first_error(&mut first_error, system.remove(&old));
                        new.set_owner(Some(*entity));
                        system.add(new);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rebuild every script created from the registry with a fresh instance
    ///
    /// Scripts without a type name, or whose type is no longer registered,
    /// are left alone. Returns the number of scripts swapped.
    pub fn live_reload_all(
        &mut self,
        registry: &ScriptRegistry,
        system: &mut ScriptSystem,
    ) -> Result<usize, ScriptError> {
        let mut reloaded = 0;

        for component in self.entities.values_mut() {
            let scripts = component.scripts().to_vec();
            for old in scripts {
                let Some(type_name) = old.type_name() else {
                    continue;
                };
                let Some(new) = registry.create(&type_name, old.name()) else {
                    warn!(target: "scripting", "Script type {} is no longer registered, keeping {}", type_name, old.name());
                    continue;
                };
                new.set_priority(old.priority());
                component.replace(&old, new);
                reloaded += 1;
            }
        }

        self.sync(system)?;

        if reloaded > 0 {
            info!(target: "scripting", "Live reloaded {} script(s)", reloaded);
        }
        Ok(reloaded)
    }
}
