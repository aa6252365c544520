//! Built-in step types of the convergence loop.
//!
//! Each step reads the shared state, drives the collaborators carried in it,
//! and returns a `StatePatch` with the fields it changed.

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use reconverge_core::error::Result;
use reconverge_core::state::{ConvergenceState, FixOutcome, FixRequest, StatePatch};
use reconverge_core::traits::{ActionContext, Step};
use reconverge_graph::StepRegistry;

use crate::fixer::{build_fix_prompt, build_user_message};

fn first_line(text: &str) -> &str {
    text.trim().lines().next().unwrap_or("")
}

// ── pre_actions ─────────────────────────────────────────────────

/// Runs the configured setup actions, once per run.
pub struct PreActionsStep;

impl Step for PreActionsStep {
    fn description(&self) -> &str {
        "Run setup actions once before the main script"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            if state.pre_actions_completed {
                debug!("Pre-actions already completed, skipping");
                return Ok(StatePatch::empty());
            }

            let actions = &state.collaborators.pre_actions;
            let dir = state
                .config_directory
                .as_deref()
                .unwrap_or(&state.working_directory);
            let total = actions.len();
            let mut results = Vec::with_capacity(total);

            for (i, action) in actions.iter().enumerate() {
                info!(
                    index = i + 1,
                    total,
                    action = %action.description(),
                    "Running pre-action"
                );
                let result = action.run(ActionContext::new(dir, state)).await;
                if result.success {
                    info!(action = %result.action, duration_ms = result.duration_ms, "Pre-action succeeded");
                } else {
                    warn!(
                        action = %result.action,
                        exit_code = ?result.exit_code,
                        error = %first_line(&result.stderr),
                        "Pre-action failed"
                    );
                }
                results.push(result);
            }

            let failed = results.iter().any(|r| !r.success);
            Ok(StatePatch {
                pre_actions_completed: Some(true),
                pre_actions_failed: Some(failed),
                pre_action_results: Some(results),
                ..Default::default()
            })
        })
    }
}

// ── run_main_script ─────────────────────────────────────────────

/// Attempts the primary task.
pub struct RunMainScriptStep;

impl Step for RunMainScriptStep {
    fn description(&self) -> &str {
        "Attempt the primary task"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            let Some(main) = &state.collaborators.main_script else {
                warn!("No main script configured, treating the primary task as succeeded");
                return Ok(StatePatch {
                    primary_task_succeeded: Some(true),
                    ..Default::default()
                });
            };

            info!(action = %main.description(), attempt = state.attempt, "Running main script");
            let result = main
                .run(ActionContext::new(&state.working_directory, state))
                .await;

            if result.success {
                info!(duration_ms = result.duration_ms, "Main script succeeded");
            } else {
                warn!(
                    exit_code = ?result.exit_code,
                    error = %first_line(&result.stderr),
                    "Main script failed"
                );
            }

            Ok(StatePatch {
                primary_task_succeeded: Some(result.success),
                main_script_result: Some(result),
                ..Default::default()
            })
        })
    }
}

// ── validate ────────────────────────────────────────────────────

/// Runs the condition checks in order, stopping at the first failure.
pub struct ValidateStep;

impl Step for ValidateStep {
    fn description(&self) -> &str {
        "Run condition checks, stopping at the first failure"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            let validators = &state.collaborators.validators;
            if validators.is_empty() {
                warn!("No validators configured, skipping validation");
                return Ok(StatePatch {
                    success: Some(true),
                    validation_results: Some(Vec::new()),
                    failed_checks: Some(Vec::new()),
                    ..Default::default()
                });
            }

            let ctx = ActionContext::new(&state.working_directory, state);
            let mut results = Vec::new();
            let mut failed_checks = Vec::new();

            for validator in validators {
                debug!(validator = %validator.name(), "Running validator");
                let result = validator.validate(ctx).await;
                let passed = result.success;
                if passed {
                    info!(validator = %validator.name(), duration_ms = result.duration_ms, "Validator passed");
                } else {
                    warn!(
                        validator = %validator.name(),
                        exit_code = ?result.exit_code,
                        "Validator failed, skipping remaining checks"
                    );
                    failed_checks.push(validator.name().to_string());
                }
                results.push(result);
                if !passed {
                    break;
                }
            }

            let success = failed_checks.is_empty();
            let failure_history = (!success).then(|| {
                let mut history = state.failure_history.clone();
                history.push(results.clone());
                history
            });

            info!(
                passed = success,
                ran = results.len(),
                configured = validators.len(),
                "Validation finished"
            );

            Ok(StatePatch {
                success: Some(success),
                validation_results: Some(results),
                failed_checks: Some(failed_checks),
                failure_history,
                ..Default::default()
            })
        })
    }
}

// ── decide ──────────────────────────────────────────────────────

/// Decision point after validation. Changes nothing; the routing function
/// attached to its outgoing transition picks the branch.
pub struct DecideStep;

impl Step for DecideStep {
    fn description(&self) -> &str {
        "Decision point after validation"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            info!(
                attempt = state.attempt,
                max_attempts = state.max_attempts(),
                checks_passed = state.success,
                budget_exhausted = state.budget_exhausted(),
                "Deciding next step"
            );
            Ok(StatePatch::empty())
        })
    }
}

// ── increment_attempt ───────────────────────────────────────────

/// Counts a new attempt.
pub struct IncrementAttemptStep;

impl Step for IncrementAttemptStep {
    fn description(&self) -> &str {
        "Count a new attempt"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            let attempt = state.attempt + 1;
            info!(attempt, max_attempts = state.max_attempts(), "Starting attempt");
            Ok(StatePatch {
                attempt: Some(attempt),
                ..Default::default()
            })
        })
    }
}

// ── ai_fix ──────────────────────────────────────────────────────

/// Hands the failure context to the fixer and records its outcome.
///
/// Fixer errors never abort the run: they are recorded as a failed
/// `FixOutcome` and the loop moves on to validation.
pub struct AiFixStep;

impl Step for AiFixStep {
    fn description(&self) -> &str {
        "Ask the fixer to repair the failure"
    }

    fn run<'a>(&'a self, state: &'a ConvergenceState) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            let outcome = match &state.collaborators.fixer {
                None => {
                    warn!("No fixer configured, skipping fix");
                    FixOutcome::failed("No fixer configured")
                }
                Some(fixer) => {
                    let request = FixRequest {
                        system_prompt: build_fix_prompt(state, state.system_prompt.as_deref()),
                        user_message: build_user_message(state),
                        working_dir: state.working_directory.clone(),
                    };
                    info!(
                        attempt = state.attempt + 1,
                        max_attempts = state.max_attempts(),
                        failed_checks = ?state.failed_checks,
                        "Requesting fix"
                    );
                    fixer.fix(request).await
                }
            };

            match &outcome.error {
                Some(e) => warn!(error = %e, "Fix attempt failed"),
                None => info!(tool_calls = outcome.tool_call_count, "Fix attempt completed"),
            }

            Ok(StatePatch {
                ai_response: Some(outcome),
                ..Default::default()
            })
        })
    }
}

/// Registry holding every built-in step type.
pub fn builtin_steps() -> StepRegistry {
    let mut steps = StepRegistry::new();
    steps.register("pre_actions", PreActionsStep);
    steps.register("run_main_script", RunMainScriptStep);
    steps.register("validate", ValidateStep);
    steps.register("decide", DecideStep);
    steps.register("increment_attempt", IncrementAttemptStep);
    steps.register("ai_fix", AiFixStep);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconverge_core::state::{Collaborators, ValidationResult};
    use reconverge_test_utils::{
        state_with, temp_workdir, CountingFixer, ScriptedAction, ScriptedValidator,
    };

    #[tokio::test]
    async fn test_pre_actions_run_once() {
        let dir = temp_workdir();
        let first = ScriptedAction::succeeding("fetch");
        let second = ScriptedAction::failing("checkout");
        let (c1, c2) = (first.calls(), second.calls());
        let mut state = state_with(
            3,
            dir.path(),
            Collaborators::new().with_pre_action(first).with_pre_action(second),
        );

        let patch = PreActionsStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.pre_actions_completed);
        assert!(state.pre_actions_failed);
        assert_eq!(state.pre_action_results.len(), 2);
        assert_eq!(state.pre_action_results[1].stderr, "scripted failure");

        let patch = PreActionsStep.run(&state).await.unwrap();
        assert!(patch.is_empty());
        assert_eq!((c1.get(), c2.get()), (1, 1));
    }

    #[tokio::test]
    async fn test_pre_actions_none_configured() {
        let dir = temp_workdir();
        let mut state = state_with(3, dir.path(), Collaborators::new());
        let patch = PreActionsStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.pre_actions_completed);
        assert!(!state.pre_actions_failed);
        assert!(state.pre_action_results.is_empty());
    }

    #[tokio::test]
    async fn test_main_script_outcome() {
        let dir = temp_workdir();
        let main = ScriptedAction::sequence("build", vec![false, true]);
        let calls = main.calls();
        let mut state = state_with(3, dir.path(), Collaborators::new().with_main_script(main));

        let patch = RunMainScriptStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(!state.primary_task_succeeded);
        assert_eq!(state.main_script_result.as_ref().unwrap().action, "build");

        let patch = RunMainScriptStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.primary_task_succeeded);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_missing_main_script_counts_as_success() {
        let dir = temp_workdir();
        let mut state = state_with(3, dir.path(), Collaborators::new());
        let patch = RunMainScriptStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.primary_task_succeeded);
        assert!(state.main_script_result.is_none());
    }

    #[tokio::test]
    async fn test_validate_stops_at_first_failure() {
        let dir = temp_workdir();
        let build = ScriptedValidator::passing("Build");
        let tests = ScriptedValidator::failing("Tests");
        let lint = ScriptedValidator::passing("Lint");
        let lint_calls = lint.calls();
        let mut state = state_with(
            3,
            dir.path(),
            Collaborators::new()
                .with_validator(build)
                .with_validator(tests)
                .with_validator(lint),
        );

        let patch = ValidateStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(!state.success);
        assert_eq!(state.failed_checks, vec!["Tests"]);
        assert_eq!(state.validation_results.len(), 2);
        assert_eq!(state.failure_history.len(), 1);
        assert_eq!(state.failure_history[0].len(), 2);
        assert_eq!(lint_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_validate_success_leaves_history_alone() {
        let dir = temp_workdir();
        let mut state = state_with(
            3,
            dir.path(),
            Collaborators::new().with_validator(ScriptedValidator::passing("Build")),
        );
        state.failure_history = vec![vec![ValidationResult::failed("Build", "boom", Some(1))]];
        state.failed_checks = vec!["Build".into()];

        let patch = ValidateStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.success);
        assert!(state.failed_checks.is_empty());
        assert_eq!(state.validation_results.len(), 1);
        assert_eq!(state.failure_history.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_without_validators_passes() {
        let dir = temp_workdir();
        let mut state = state_with(3, dir.path(), Collaborators::new());
        state.validation_results = vec![ValidationResult::failed("Old", "", Some(1))];
        let patch = ValidateStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.success);
        assert!(state.validation_results.is_empty());
        assert!(state.failed_checks.is_empty());
    }

    #[tokio::test]
    async fn test_decide_changes_nothing() {
        let dir = temp_workdir();
        let state = state_with(3, dir.path(), Collaborators::new());
        assert!(DecideStep.run(&state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_increment_attempt() {
        let dir = temp_workdir();
        let mut state = state_with(3, dir.path(), Collaborators::new());
        for expected in 1..=2 {
            let patch = IncrementAttemptStep.run(&state).await.unwrap();
            state.apply(patch);
            assert_eq!(state.attempt, expected);
        }
    }

    #[tokio::test]
    async fn test_ai_fix_builds_request() {
        let dir = temp_workdir();
        let fixer = CountingFixer::new();
        let requests = fixer.requests();
        let mut state = state_with(4, dir.path(), Collaborators::new().with_fixer(fixer))
            .with_system_prompt("You keep the fork building.");
        state.attempt = 1;
        state.failed_checks = vec!["Build".into()];
        state.validation_results = vec![ValidationResult::failed("Build", "undefined: foo", Some(2))];

        let patch = AiFixStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(state.ai_response.as_ref().unwrap().success);

        let sent = requests.all();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].system_prompt.starts_with("You keep the fork building."));
        assert!(sent[0].system_prompt.contains("Attempt: 2/4"));
        assert!(sent[0].user_message.contains("undefined: foo"));
        assert_eq!(sent[0].working_dir, dir.path());
    }

    #[tokio::test]
    async fn test_ai_fix_failure_is_recorded() {
        let dir = temp_workdir();
        let fixer = CountingFixer::returning(FixOutcome::failed("rate limited"));
        let mut state = state_with(3, dir.path(), Collaborators::new().with_fixer(fixer));
        let patch = AiFixStep.run(&state).await.unwrap();
        state.apply(patch);
        let response = state.ai_response.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_ai_fix_without_fixer() {
        let dir = temp_workdir();
        let mut state = state_with(3, dir.path(), Collaborators::new());
        let patch = AiFixStep.run(&state).await.unwrap();
        state.apply(patch);
        assert!(!state.ai_response.unwrap().success);
    }

    #[test]
    fn test_builtin_steps_registered() {
        let steps = builtin_steps();
        assert_eq!(steps.len(), 6);
        for name in [
            "pre_actions",
            "run_main_script",
            "validate",
            "decide",
            "increment_attempt",
            "ai_fix",
        ] {
            assert!(steps.is_registered(name), "{name} missing");
        }
    }
}
