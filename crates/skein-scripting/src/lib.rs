/// Script execution for the simulation loop
///
/// User code plugs into the simulation through three kinds of scripts:
/// - [`StartupScript`]: one-time `start`/`cancel` hooks
/// - [`SyncScript`]: additionally updated once per frame, in priority order
/// - [`AsyncScript`]: a body running as a micro-thread, free to suspend
///   across frames
///
/// The [`ScriptSystem`] owns the micro-thread scheduler and drives all of them
/// from the host's per-frame update. Entities feed scripts to it through the
/// [`ScriptProcessor`].
use futures::future::LocalBoxFuture;

pub mod component;
pub mod context;
pub mod registry;
pub mod script;
pub mod script_system;
pub mod services;

pub use component::{EntityId, ScriptComponent, ScriptProcessor};
pub use context::{FrameTime, ScriptContext};
pub use registry::ScriptRegistry;
pub use script::{Script, ScriptId, ScriptKind, ScriptState};
pub use script_system::{EntryPoint, ScriptError, ScriptSystem};
pub use services::ServiceRegistry;

/// Result type returned by every script entry point
pub type ScriptResult = anyhow::Result<()>;

/// Script with one-time hooks around its registration
///
/// Both hooks are plain synchronous calls; they cannot suspend.
pub trait StartupScript: 'static {
    /// Called once, before any update or execute of the frame it was added in
    fn start(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        Ok(())
    }

    /// Called once when the script is removed after it was started
    fn cancel(&mut self, _ctx: &ScriptContext) -> ScriptResult {
        Ok(())
    }
}

/// Script updated every frame after the micro-thread pass
pub trait SyncScript: StartupScript {
    /// Called every frame, in ascending priority order
    ///
    /// Runs on the simulation thread: it must not block.
    fn update(&mut self, ctx: &ScriptContext) -> ScriptResult;
}

/// Script whose body runs as a micro-thread
///
/// The body may await [`ScriptContext::next_frame`], [`ScriptContext::when_all`]
/// or any other future. Removing the script cancels the micro-thread: the
/// future is dropped the next time it would have been resumed.
pub trait AsyncScript: 'static {
    fn execute(&mut self, ctx: ScriptContext) -> LocalBoxFuture<'_, ScriptResult>;
}
