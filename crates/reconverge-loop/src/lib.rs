//! The built-in convergence loop.
//!
//! Provides the step types and routing functions that make up the retry
//! policy, the default topology wiring them together, the concrete sub-step
//! collaborators (shell commands, async closures, condition checks, and an
//! agent-CLI fixer), and the `ConvergenceRunner` / `run_convergence` entry
//! points.

pub mod actions;
pub mod exec;
pub mod fixer;
pub mod routing;
pub mod runner;
pub mod steps;
pub mod topology;
pub mod validators;

pub use routing::builtin_routes;
pub use runner::{
    collaborators_from_config, initial_state, run_convergence, ConvergenceReport,
    ConvergenceRunner, RunOptions,
};
pub use steps::builtin_steps;
pub use topology::default_topology;
