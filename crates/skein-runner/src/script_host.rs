use skein_events::SharedConsumer;
use skein_scripting::{
    EntityId, FrameTime, ScriptComponent, ScriptError, ScriptProcessor, ScriptRegistry,
    ScriptSystem, ServiceRegistry,
};
use tracing::{debug, info};

use crate::config::ScriptingConfig;
use crate::simulation::BuildError;

/// Script system together with the entity glue and the script factories
///
/// This is what the host loop updates in the scripts slot: pending entity
/// changes are forwarded first, then the script system runs its frame.
#[derive(Debug)]
pub struct ScriptHost {
    system: ScriptSystem,
    processor: ScriptProcessor,
    registry: ScriptRegistry,
}

impl ScriptHost {
    pub fn new(registry: ScriptRegistry, services: ServiceRegistry) -> Self {
        Self {
            system: ScriptSystem::with_services(services),
            processor: ScriptProcessor::new(),
            registry,
        }
    }

    /// Build a host and attach the entities listed in `config`
    pub fn from_config(
        config: &ScriptingConfig,
        registry: ScriptRegistry,
        services: ServiceRegistry,
    ) -> Result<Self, BuildError> {
        let mut host = Self::new(registry, services);
        host.system
            .set_propagate_exceptions(config.propagate_exceptions);

        for entity in &config.entities {
            let mut component = ScriptComponent::new();
            for entry in &entity.scripts {
                let script = host
                    .registry
                    .create(&entry.type_name, entry.instance_name())
                    .ok_or_else(|| BuildError::UnknownScriptType {
                        entity: entity.id,
                        type_name: entry.type_name.clone(),
                    })?
                    .with_priority(entry.priority);
                component.push(script);
            }

            debug!(target: "runner", "Spawning entity {} with {} script(s)", entity.id, component.len());
            host.attach(EntityId(entity.id), component)?;
        }

        info!(
            target: "runner",
            "Script host ready: {} entity(ies), {} script(s)",
            host.processor.entity_count(),
            host.system.registered_count()
        );
        Ok(host)
    }

    pub fn system(&self) -> &ScriptSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut ScriptSystem {
        &mut self.system
    }

    pub fn processor(&self) -> &ScriptProcessor {
        &self.processor
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub fn set_consumer(&mut self, consumer: Option<SharedConsumer>) {
        self.system.set_consumer(consumer);
    }

    pub fn attach(&mut self, entity: EntityId, component: ScriptComponent) -> Result<(), ScriptError> {
        self.processor.attach(entity, component, &mut self.system)
    }

    pub fn detach(&mut self, entity: EntityId) -> Result<Option<ScriptComponent>, ScriptError> {
        self.processor.detach(entity, &mut self.system)
    }

    /// Edit an attached entity's scripts; applied at the start of the next update
    pub fn component_mut(&mut self, entity: EntityId) -> Option<&mut ScriptComponent> {
        self.processor.component_mut(entity)
    }

    /// Forward entity changes, then run one frame of the script system
    pub fn update(&mut self, time: FrameTime) -> Result<(), ScriptError> {
        self.processor.sync(&mut self.system)?;
        self.system.update(time)
    }

    /// Swap every registry-built script for a fresh instance
    pub fn reload(&mut self) -> Result<usize, ScriptError> {
        self.processor
            .live_reload_all(&self.registry, &mut self.system)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntityConfig, ScriptEntry};
    use skein_scripting::{Script, ScriptContext, ScriptResult, StartupScript, SyncScript};
    use std::time::Duration;

    struct Idle;

    impl StartupScript for Idle {}

    impl SyncScript for Idle {
        fn update(&mut self, _ctx: &ScriptContext) -> ScriptResult {
            Ok(())
        }
    }

    fn registry() -> ScriptRegistry {
        let mut registry = ScriptRegistry::new();
        registry.register("idle", |name| Script::from_sync(name, Idle));
        registry
    }

    fn config(type_name: &str) -> ScriptingConfig {
        ScriptingConfig {
            entities: vec![EntityConfig {
                id: 9,
                scripts: vec![ScriptEntry::new(type_name).with_priority(4)],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_from_config_attaches_scripts() {
        let host = ScriptHost::from_config(&config("idle"), registry(), ServiceRegistry::new())
            .unwrap();

        let component = host.processor().component(EntityId(9)).unwrap();
        assert_eq!(component.len(), 1);
        assert_eq!(component.scripts()[0].priority(), 4);
        assert_eq!(component.scripts()[0].owner(), Some(EntityId(9)));
        assert_eq!(host.system().pending_start_count(), 1);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = ScriptHost::from_config(&config("ghost"), registry(), ServiceRegistry::new())
            .unwrap_err();

        assert!(matches!(
            err,
            BuildError::UnknownScriptType { entity: 9, ref type_name } if type_name == "ghost"
        ));
    }

    #[test]
    fn test_reload_swaps_instances() {
        let mut host =
            ScriptHost::from_config(&config("idle"), registry(), ServiceRegistry::new()).unwrap();
        let time = FrameTime::default().advance(Duration::from_millis(16));
        host.update(time).unwrap();

        let before = host.processor().component(EntityId(9)).unwrap().scripts()[0].clone();
        assert_eq!(host.reload().unwrap(), 1);
        let after = host.processor().component(EntityId(9)).unwrap().scripts()[0].clone();

        assert_ne!(before.id(), after.id());
        assert_eq!(after.priority(), 4);
        assert!(!host.system().is_registered(&before));
        assert!(host.system().is_registered(&after));
    }
}
