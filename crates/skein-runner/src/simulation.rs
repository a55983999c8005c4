//! The host loop: ordered game systems around the script host, paced by a
//! tokio interval.

use std::time::{Duration, Instant};

use skein_events::{EventEmitter, EventSource, EventType, SharedConsumer, SystemEvent};
use skein_scripting::{FrameTime, ScriptError, ScriptRegistry, ServiceRegistry};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::SkeinConfig;
use crate::game_system::{GameSystem, update_order};
use crate::reload::ReloadSignal;
use crate::script_host::ScriptHost;

/// Error during simulation setup
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Frame rate must be at least 1 fps")]
    InvalidFrameRate,
    #[error("Entity {entity} uses unknown script type '{type_name}'")]
    UnknownScriptType { entity: u64, type_name: String },
    #[error("Failed to attach scripts: {0}")]
    Script(#[from] ScriptError),
}

/// Error that stops the host loop
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("System '{name}' failed")]
    System {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Builder for [`Simulation`]
pub struct SimulationBuilder {
    config: SkeinConfig,
    registry: ScriptRegistry,
    services: ServiceRegistry,
    systems: Vec<Box<dyn GameSystem>>,
    consumer: Option<SharedConsumer>,
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self {
            config: SkeinConfig::default(),
            registry: ScriptRegistry::new(),
            services: ServiceRegistry::new(),
            systems: Vec::new(),
            consumer: None,
        }
    }

    pub fn with_config(mut self, config: SkeinConfig) -> Self {
        self.config = config;
        self
    }

    /// Script factories used by the config's entities and by live reload
    pub fn with_registry(mut self, registry: ScriptRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Services shared with every script
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn with_system(mut self, system: impl GameSystem) -> Self {
        self.systems.push(Box::new(system));
        self
    }

    /// Consumer receiving script, micro-thread and host events
    pub fn with_consumer(mut self, consumer: SharedConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn build(self) -> Result<Simulation, BuildError> {
        if self.config.simulation.fps == 0 {
            return Err(BuildError::InvalidFrameRate);
        }

        let mut host = ScriptHost::from_config(&self.config.scripting, self.registry, self.services)?;
        host.set_consumer(self.consumer.clone());

        let mut systems = self.systems;
        // Stable: systems sharing a slot keep their registration order
        systems.sort_by_key(|system| system.update_order());
        for system in &systems {
            debug!(target: "runner", "System {} at order {}", system.name(), system.update_order());
        }

        Ok(Simulation {
            host,
            systems,
            time: FrameTime::default(),
            frame_duration: self.config.simulation.frame_duration(),
            max_frames: self.config.simulation.max_frames,
            live_reload: self.config.scripting.live_reload,
            events: EventEmitter::new(self.consumer),
        })
    }
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running simulation: the script host plus every other game system
///
/// Like the script system it owns, a simulation is bound to the thread that
/// built it.
pub struct Simulation {
    host: ScriptHost,
    systems: Vec<Box<dyn GameSystem>>,
    time: FrameTime,
    frame_duration: Duration,
    max_frames: Option<u64>,
    live_reload: bool,
    events: EventEmitter,
}

impl Simulation {
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::new()
    }

    pub fn host(&self) -> &ScriptHost {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut ScriptHost {
        &mut self.host
    }

    /// Timing of the last simulated frame
    pub fn time(&self) -> FrameTime {
        self.time
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    /// Simulate one frame that lasted `elapsed`
    ///
    /// Systems ordered before [`update_order::SCRIPTS`] run first, then the
    /// script host, then the remaining systems.
    pub fn step(&mut self, elapsed: Duration) -> Result<FrameTime, RunnerError> {
        let started = Instant::now();
        let time = self.time.advance(elapsed);
        self.time = time;

        let split = self
            .systems
            .partition_point(|system| system.update_order() < update_order::SCRIPTS);
        let (before, after) = self.systems.split_at_mut(split);

        update_systems(before, &time)?;
        self.host.update(time)?;
        update_systems(after, &time)?;

        let elapsed_micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.emit(SystemEvent::FrameCompleted {
            frame: time.frame,
            elapsed_micros,
        });
        Ok(time)
    }

    /// Rebuild every registry-built script, as a SIGUSR2 does
    pub fn reload_scripts(&mut self) -> Result<usize, RunnerError> {
        info!(target: "runner", "Reloading scripts at frame {}", self.time.frame);
        self.emit(SystemEvent::ReloadScripts);
        Ok(self.host.reload()?)
    }

    /// Run frames at the configured rate until shutdown or the frame limit
    ///
    /// Without a shutdown receiver the loop stops on Ctrl+C. Reload signals
    /// are ignored when live reload is disabled. Returns the number of frames
    /// simulated by this call.
    pub async fn run(
        &mut self,
        mut shutdown_rx: Option<watch::Receiver<bool>>,
        mut reload_rx: watch::Receiver<Option<ReloadSignal>>,
    ) -> Result<u64, RunnerError> {
        info!(
            target: "runner",
            "Simulation loop started ({:?} per frame, limit {:?})",
            self.frame_duration, self.max_frames
        );

        let mut interval = tokio::time::interval(self.frame_duration);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut frames = 0u64;
        let mut last_tick: Option<tokio::time::Instant> = None;
        let mut reload_open = true;

        let result = loop {
            if self.max_frames.is_some_and(|max| self.time.frame >= max) {
                info!(target: "runner", "Reached frame limit {}", self.time.frame);
                break Ok(frames);
            }

            tokio::select! {
                biased;

                _ = async {
                    if let Some(ref mut rx) = shutdown_rx {
                        // A dropped sender never signals again
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    } else {
                        std::future::pending::<()>().await
                    }
                } => {
                    info!(target: "runner", "Simulation received shutdown signal");
                    break Ok(frames);
                }
                _ = tokio::signal::ctrl_c(), if shutdown_rx.is_none() => {
                    info!(target: "runner", "Received Ctrl+C, shutting down gracefully...");
                    break Ok(frames);
                }
                changed = reload_rx.changed(), if reload_open => {
                    if changed.is_err() {
                        reload_open = false;
                        continue;
                    }
                    let requested = reload_rx.borrow_and_update().is_some();
                    if !requested {
                        continue;
                    }
                    if !self.live_reload {
                        warn!(target: "runner", "Live reload is disabled, ignoring reload request");
                        continue;
                    }
                    if let Err(e) = self.reload_scripts() {
                        break Err(e);
                    }
                }
                now = interval.tick() => {
                    let elapsed = last_tick.map_or(self.frame_duration, |last| now - last);
                    last_tick = Some(now);

                    if let Err(e) = self.step(elapsed) {
                        error!(target: "runner", "Frame {} failed: {}", self.time.frame, e);
                        break Err(e);
                    }
                    frames += 1;
                }
            }
        };

        self.emit(SystemEvent::Shutdown);
        info!(target: "runner", "Simulation loop stopped after {} frame(s)", frames);
        result
    }

    fn emit(&mut self, event: SystemEvent) {
        self.events
            .emit(EventType::System(event), self.time.frame, EventSource::Host);
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("frame", &self.time.frame)
            .field(
                "systems",
                &self.systems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("max_frames", &self.max_frames)
            .finish()
    }
}

fn update_systems(systems: &mut [Box<dyn GameSystem>], time: &FrameTime) -> Result<(), RunnerError> {
    for system in systems {
        system.update(time).map_err(|source| RunnerError::System {
            name: system.name().to_string(),
            source,
        })?;
    }
    Ok(())
}
