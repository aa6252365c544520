//! Pre-action and main-script implementations.

pub mod callable;
pub mod command;

pub use callable::{CallContext, CallableAction, OutputSink};
pub use command::{substitute_vars, CommandAction};
