//! Condition-check implementations.

pub mod callable;
pub mod command;
pub mod git_conflict;
pub mod test_suite;

use std::sync::Arc;

use reconverge_core::config::ValidatorConfig;
use reconverge_core::traits::Validator;

pub use callable::CallableValidator;
pub use command::CommandValidator;
pub use git_conflict::GitConflictValidator;
pub use test_suite::TestSuiteValidator;

/// Build a validator from its config entry.
pub fn from_config(config: &ValidatorConfig) -> Arc<dyn Validator> {
    match config {
        ValidatorConfig::Command {
            name,
            command,
            timeout_secs,
            capture_lines,
        } => Arc::new(
            CommandValidator::new(name.clone(), command.clone())
                .with_timeout_secs(*timeout_secs)
                .with_capture_lines(*capture_lines),
        ),
        ValidatorConfig::GitConflict { name, timeout_secs } => Arc::new(
            GitConflictValidator::new()
                .with_name(name.clone())
                .with_timeout_secs(*timeout_secs),
        ),
        ValidatorConfig::TestSuite {
            name,
            command,
            timeout_secs,
            capture_lines,
        } => Arc::new(
            TestSuiteValidator::new(name.clone(), command.clone())
                .with_timeout_secs(*timeout_secs)
                .with_capture_lines(*capture_lines),
        ),
    }
}
