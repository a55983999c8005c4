use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use skein_microthread::MicroThread;
use skein_runner::SkeinConfig;
use skein_scripting::{
    AsyncScript, Script, ScriptContext, ScriptRegistry, ScriptResult, StartupScript, SyncScript,
};

/// Shared state the demo scripts act on
#[derive(Debug, Default)]
pub struct World {
    headings: RefCell<BTreeMap<String, f32>>,
    greeted: RefCell<Vec<String>>,
    waypoints_reached: Cell<u32>,
    scouts_returned: Cell<u32>,
    beats: Cell<u32>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Heading in degrees of a spinner, by script name
    pub fn heading(&self, name: &str) -> Option<f32> {
        self.headings.borrow().get(name).copied()
    }

    pub fn greeted(&self) -> Vec<String> {
        self.greeted.borrow().clone()
    }

    pub fn waypoints_reached(&self) -> u32 {
        self.waypoints_reached.get()
    }

    pub fn scouts_returned(&self) -> u32 {
        self.scouts_returned.get()
    }

    pub fn beats(&self) -> u32 {
        self.beats.get()
    }

    fn rotate(&self, name: &str, degrees: f32) -> f32 {
        let mut headings = self.headings.borrow_mut();
        let heading = headings.entry(name.to_string()).or_insert(0.0);
        *heading = (*heading + degrees).rem_euclid(360.0);
        *heading
    }
}

fn world(ctx: &ScriptContext) -> anyhow::Result<Rc<World>> {
    ctx.service::<World>()
        .ok_or_else(|| anyhow!("World service is not registered"))
}

/// Turns at a constant rate every frame
pub struct Spinner {
    degrees_per_second: f32,
}

impl StartupScript for Spinner {}

impl SyncScript for Spinner {
    fn update(&mut self, ctx: &ScriptContext) -> ScriptResult {
        let dt = ctx.time().elapsed.as_secs_f32();
        let heading = world(ctx)?.rotate(ctx.name(), self.degrees_per_second * dt);
        if ctx.frame() % 60 == 0 {
            ctx.log(format!("heading {:.1} degrees", heading));
        }
        Ok(())
    }
}

/// Says hello when started and goodbye when removed
pub struct Greeter;

impl StartupScript for Greeter {
    fn start(&mut self, ctx: &ScriptContext) -> ScriptResult {
        world(ctx)?.greeted.borrow_mut().push(ctx.name().to_string());
        if ctx.is_live_reloading() {
            ctx.log("reloaded");
        } else {
            ctx.log(format!("hello at frame {}", ctx.frame()));
        }
        Ok(())
    }

    fn cancel(&mut self, ctx: &ScriptContext) -> ScriptResult {
        if !ctx.is_live_reloading() {
            ctx.log("goodbye");
        }
        Ok(())
    }
}

/// Sends scouts ahead, then walks its waypoints forever
pub struct Patrol {
    waypoints: Vec<(f32, f32)>,
    frames_per_leg: u32,
    scouts: u32,
}

impl Patrol {
    fn spawn_scout(ctx: &ScriptContext, world: Rc<World>, index: u32) -> MicroThread {
        let scout_ctx = ctx.clone();
        let thread = ctx.scheduler().add(move || async move {
            for _ in 0..=index {
                scout_ctx.next_frame().await;
            }
            world.scouts_returned.set(world.scouts_returned.get() + 1);
            Ok(())
        });
        thread.set_name(format!("{}-scout-{}", ctx.name(), index));
        thread
    }
}

impl AsyncScript for Patrol {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
        async move {
            let world = world(&ctx)?;

            let scouts: Vec<_> = (0..self.scouts)
                .map(|index| Self::spawn_scout(&ctx, world.clone(), index))
                .collect();
            ctx.when_all(scouts)
                .await
                .map_err(|e| anyhow!("scouts did not return: {}", e))?;
            ctx.log(format!("{} scout(s) back, starting patrol", self.scouts));

            if self.waypoints.is_empty() {
                return Ok(());
            }

            for (x, y) in self.waypoints.iter().copied().cycle() {
                for _ in 0..self.frames_per_leg {
                    ctx.next_frame().await;
                }
                world.waypoints_reached.set(world.waypoints_reached.get() + 1);
                tracing::debug!(target: "script", "[{}] reached ({}, {})", ctx.name(), x, y);
            }
            Ok(())
        }
        .boxed_local()
    }
}

/// Beats once every `period` frames
pub struct Heartbeat {
    period: u32,
}

impl AsyncScript for Heartbeat {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult> {
        async move {
            let world = world(&ctx)?;
            loop {
                for _ in 0..self.period {
                    ctx.next_frame().await;
                }
                world.beats.set(world.beats.get() + 1);
                if world.beats() % 10 == 0 {
                    ctx.log(format!("{} beats", world.beats()));
                }
            }
        }
        .boxed_local()
    }
}

/// Config written by `skein init-config` and used when no config file exists
pub const EXAMPLE_CONFIG: &str = r#"# skein configuration

[simulation]
fps = 60
# Stop after this many frames; remove to run until Ctrl+C
max_frames = 600

[scripting]
propagate_exceptions = false
live_reload = true

[[scripting.entities]]
id = 1

[[scripting.entities.scripts]]
type = "greeter"
name = "hello"

[[scripting.entities.scripts]]
type = "spinner"
priority = -10

[[scripting.entities]]
id = 2

[[scripting.entities.scripts]]
type = "patrol"

[[scripting.entities.scripts]]
type = "heartbeat"
priority = 5

[logging]
file = false
"#;

/// Parse [`EXAMPLE_CONFIG`]
pub fn example_config() -> Result<SkeinConfig, toml::de::Error> {
    toml::from_str(EXAMPLE_CONFIG)
}

/// Script types available to config files
pub fn demo_registry() -> ScriptRegistry {
    let mut registry = ScriptRegistry::new();
    registry.register("spinner", |name| {
        Script::from_sync(
            name,
            Spinner {
                degrees_per_second: 90.0,
            },
        )
    });
    registry.register("greeter", |name| Script::from_startup(name, Greeter));
    registry.register("patrol", |name| {
        Script::from_async(
            name,
            Patrol {
                waypoints: vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)],
                frames_per_leg: 30,
                scouts: 2,
            },
        )
    });
    registry.register("heartbeat", |name| {
        Script::from_async(name, Heartbeat { period: 60 })
    });
    registry
}
