pub mod config;
pub mod error;
pub mod spec;
pub mod state;
pub mod traits;

pub use config::ConvergenceConfig;
pub use error::{ConvergeError, Result};
pub use spec::{GraphSpec, StepSpec, Targets, TransitionSpec, END, START};
pub use state::*;
pub use traits::{Action, ActionContext, Fixer, Router, Step, Validator};
