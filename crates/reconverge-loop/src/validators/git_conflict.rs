use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::debug;

use reconverge_core::state::ValidationResult;
use reconverge_core::traits::{ActionContext, Validator};

use crate::exec::run_process;

const GIT_DIFF_CHECK: &str = "git diff --check";

/// Fails when `git diff --check` reports conflict markers or whitespace errors.
pub struct GitConflictValidator {
    name: String,
    timeout: Duration,
}

impl GitConflictValidator {
    pub fn new() -> Self {
        Self {
            name: "Git Conflict Check".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }
}

impl Default for GitConflictValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for GitConflictValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ValidationResult> {
        Box::pin(async move {
            let timestamp = Utc::now();
            let mut cmd = Command::new("git");
            cmd.args(["diff", "--check"]).current_dir(ctx.working_dir);
            let out = run_process(cmd, self.timeout).await;

            let has_conflicts = out.exit_code.is_some() && !out.success();
            debug!(validator = %self.name, has_conflicts, "Git conflict check finished");

            ValidationResult {
                validator_name: self.name.clone(),
                success: out.success(),
                output: out.stdout,
                stderr: out.stderr,
                exit_code: out.exit_code,
                duration_ms: out.duration_ms,
                timestamp,
                metadata: Default::default(),
            }
            .with_metadata("command", serde_json::json!(GIT_DIFF_CHECK))
            .with_metadata("has_conflicts", serde_json::json!(has_conflicts))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconverge_core::state::ConvergenceState;

    async fn git(dir: &std::path::Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_detects_conflict_markers() {
        let dir = tempfile::tempdir().unwrap();
        git(dir.path(), &["init", "-q"]).await;
        git(dir.path(), &["config", "user.email", "ci@example.com"]).await;
        git(dir.path(), &["config", "user.name", "ci"]).await;
        std::fs::write(dir.path().join("a.txt"), "clean\n").unwrap();
        git(dir.path(), &["add", "a.txt"]).await;
        git(dir.path(), &["commit", "-q", "-m", "init"]).await;

        let state = ConvergenceState::new(1, dir.path());
        let validator = GitConflictValidator::new();

        let clean = validator.validate(ActionContext::new(dir.path(), &state)).await;
        assert!(clean.success);
        assert_eq!(clean.metadata["has_conflicts"], serde_json::json!(false));

        std::fs::write(
            dir.path().join("a.txt"),
            "<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> branch\n",
        )
        .unwrap();
        let dirty = validator.validate(ActionContext::new(dir.path(), &state)).await;
        assert!(!dirty.success);
        assert_eq!(dirty.metadata["has_conflicts"], serde_json::json!(true));
        assert_eq!(dirty.metadata["command"], serde_json::json!("git diff --check"));
    }
}
