use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use reconverge_core::state::ValidationResult;
use reconverge_core::traits::{ActionContext, Validator};

use crate::actions::substitute_vars;
use crate::exec::{run_shell, tail_lines};

/// Runs a test-suite command. Keeps the tail of stdout and all of stderr,
/// without parsing framework-specific output.
pub struct TestSuiteValidator {
    name: String,
    command: String,
    timeout: Duration,
    capture_lines: usize,
}

impl TestSuiteValidator {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: Duration::from_secs(1800),
            capture_lines: 200,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_capture_lines(mut self, lines: usize) -> Self {
        self.capture_lines = lines;
        self
    }
}

impl Validator for TestSuiteValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            let timestamp = Utc::now();
            let command = substitute_vars(&self.command, ctx.env_vars());
            debug!(validator = %self.name, command = %command, "Running test suite");

            let out = run_shell(&command, ctx.working_dir, self.timeout).await;

            let result = ValidationResult {
                validator_name: self.name.clone(),
                success: out.success(),
                output: tail_lines(&out.stdout, self.capture_lines),
                stderr: out.stderr,
                exit_code: out.exit_code,
                duration_ms: out.duration_ms,
                timestamp,
                metadata: Default::default(),
            }
            .with_metadata("command", serde_json::json!(command));

            if out.timed_out {
                result.with_metadata("timeout", serde_json::json!(true))
            } else {
                result
            }
        })
    }
}
