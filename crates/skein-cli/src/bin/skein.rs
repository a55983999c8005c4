use std::error::Error;
use std::fs;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::{Parser, Subcommand};
use skein_events::FanOutConsumer;
use skein_runner::{
    ConfigLoadError, FnSystem, LoggingConsumer, Simulation, SkeinConfig, init_logging,
    setup_reload_signal, update_order,
};
use skein_scripting::{FrameTime, ServiceRegistry};
use tracing::info;

use skein_cli::{EXAMPLE_CONFIG, ScriptTally, World, demo_registry, example_config};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug mode (repeat for trace logging)
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Config file to use instead of the default location
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(short, long)]
    frames: Option<u64>,

    /// Target frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Let script faults stop the simulation
    #[arg(long)]
    propagate_exceptions: bool,

    /// Also write logs to a file in the data directory
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Write an example config file
    InitConfig {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn create_example_config(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        )
        .into());
    }

    // Create parent directories if they don't exist
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, EXAMPLE_CONFIG)?;
    eprintln!("Config file created at: {}", path.display());
    eprintln!("Edit it to choose which scripts run, then run skein again.");

    Ok(())
}

/// Load the config, falling back to the example when none was written yet
fn load_config(path: Option<&Path>) -> Result<(SkeinConfig, String), Box<dyn Error>> {
    let loaded = match path {
        Some(path) => SkeinConfig::load_from(path),
        None => SkeinConfig::load(),
    };

    match loaded {
        Ok(config) => Ok((config, "config file".to_string())),
        Err(ConfigLoadError::NotFound(missing)) if path.is_none() => Ok((
            example_config()?,
            format!("built-in example (no config at {})", missing.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn filter_for(debug: u8) -> &'static str {
    match debug {
        0 => "info",
        1 => "info,scheduler=debug,scripting=debug,runner=debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Some(Command::InitConfig { force }) = cli.command {
        let path = match cli.config {
            Some(path) => path,
            None => SkeinConfig::config_path()?,
        };
        return create_example_config(&path, force);
    }

    let (mut config, source) = load_config(cli.config.as_deref())?;
    if let Some(frames) = cli.frames {
        config.simulation.max_frames = Some(frames);
    }
    if let Some(fps) = cli.fps {
        config.simulation.fps = fps;
    }
    if cli.propagate_exceptions {
        config.scripting.propagate_exceptions = true;
    }

    let _guard = init_logging("cli", cli.log_file || config.logging.file, filter_for(cli.debug))?;
    info!("Starting skein with {}", source);

    let world = Rc::new(World::new());
    let mut services = ServiceRegistry::new();
    services.insert_shared(world.clone());

    let logging = Rc::new(RefCell::new(LoggingConsumer::new()));
    let tally = Rc::new(RefCell::new(ScriptTally::new()));
    let consumer = FanOutConsumer::new()
        .with(logging.clone())
        .with(tally.clone());

    let status_world = world.clone();
    let mut simulation = Simulation::builder()
        .with_config(config)
        .with_registry(demo_registry())
        .with_services(services)
        .with_consumer(Rc::new(RefCell::new(consumer)))
        .with_system(FnSystem::new("status", update_order::UI, move |time: &FrameTime| {
            if time.frame % 300 == 0 {
                info!(
                    "Frame {}: {} beat(s), {} waypoint(s) reached",
                    time.frame,
                    status_world.beats(),
                    status_world.waypoints_reached()
                );
            }
            Ok(())
        }))
        .build()?;

    let reload_rx = setup_reload_signal();
    let frames = simulation.run(None, reload_rx).await?;

    info!(
        "Simulated {} frame(s): greeted {:?}, {} scout(s) returned, {} waypoint(s), {} beat(s)",
        frames,
        world.greeted(),
        world.scouts_returned(),
        world.waypoints_reached(),
        world.beats()
    );
    info!("{} fault(s) reported", logging.borrow().faults());
    for (name, counts) in tally.borrow().iter() {
        info!(
            "Script {}: started {} time(s), faulted {} time(s)",
            name, counts.starts, counts.faults
        );
    }

    Ok(())
}
