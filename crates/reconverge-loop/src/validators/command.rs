use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use reconverge_core::state::ValidationResult;
use reconverge_core::traits::{ActionContext, Validator};

use crate::actions::substitute_vars;
use crate::exec::{run_shell, tail_lines};

/// Runs a shell command; passes on exit code 0.
pub struct CommandValidator {
    name: String,
    command: String,
    timeout: Duration,
    capture_lines: usize,
}

impl CommandValidator {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            timeout: Duration::from_secs(600),
            capture_lines: 100,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    /// Lines kept from the end of each stream.
    pub fn with_capture_lines(mut self, lines: usize) -> Self {
        self.capture_lines = lines;
        self
    }
}

impl Validator for CommandValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            let timestamp = Utc::now();
            let command = substitute_vars(&self.command, ctx.env_vars());
            debug!(validator = %self.name, command = %command, "Running command validator");

            let out = run_shell(&command, ctx.working_dir, self.timeout).await;

            let mut result = ValidationResult {
                validator_name: self.name.clone(),
                success: out.success(),
                output: tail_lines(&out.stdout, self.capture_lines),
                stderr: tail_lines(&out.stderr, self.capture_lines),
                exit_code: out.exit_code,
                duration_ms: out.duration_ms,
                timestamp,
                metadata: Default::default(),
            }
            .with_metadata("command", serde_json::json!(command));
            if out.timed_out {
                result = result.with_metadata("timeout", serde_json::json!(true));
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconverge_core::state::ConvergenceState;
    use std::path::Path;

    #[tokio::test]
    async fn test_pass_and_fail() {
        let state = ConvergenceState::new(1, ".");
        let ctx = ActionContext::new(Path::new("."), &state);

        let ok = CommandValidator::new("ok", "true").validate(ctx).await;
        assert!(ok.success);
        assert_eq!(ok.exit_code, Some(0));
        assert_eq!(ok.metadata["command"], serde_json::json!("true"));

        let bad = CommandValidator::new("bad", "echo nope >&2; exit 1").validate(ctx).await;
        assert!(!bad.success);
        assert_eq!(bad.validator_name, "bad");
        assert_eq!(bad.stderr.trim(), "nope");
    }

    #[tokio::test]
    async fn test_keeps_last_lines() {
        let state = ConvergenceState::new(1, ".");
        let ctx = ActionContext::new(Path::new("."), &state);
        let result = CommandValidator::new("seq", "seq 1 10")
            .with_capture_lines(3)
            .validate(ctx)
            .await;
        // Trailing newline leaves an empty last line.
        assert_eq!(result.output, "9\n10\n");
    }
}
