//! Demo scripts, the world they act on and the exit report of the `skein`
//! binary.

pub mod demo;
pub mod tally;

pub use demo::{EXAMPLE_CONFIG, World, demo_registry, example_config};
pub use tally::{ScriptCounts, ScriptTally};
