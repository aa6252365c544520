use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::{Action, Fixer, Validator};

/// Result of running a pre-action or the main script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Description of what was run.
    pub action: String,
    pub success: bool,
    /// Captured stdout (truncated).
    pub output: String,
    /// Captured stderr (truncated).
    pub stderr: String,
    /// Process exit code; `None` on timeout or spawn failure.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ActionResult {
    /// A failed result that never produced an exit code.
    pub fn fault(action: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            success: false,
            stderr: stderr.into(),
            ..Default::default()
        }
    }
}

/// Result of running one condition check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub validator_name: String,
    pub success: bool,
    pub output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// When the check started.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl ValidationResult {
    pub fn passed(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            validator_name: name.into(),
            success: true,
            output: output.into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn failed(name: impl Into<String>, stderr: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            validator_name: name.into(),
            success: false,
            output: String::new(),
            stderr: stderr.into(),
            exit_code,
            duration_ms: 0,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What the fix step hands to a `Fixer`.
#[derive(Debug, Clone)]
pub struct FixRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub working_dir: PathBuf,
}

/// What a `Fixer` reports back. Failures are data, never errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub success: bool,
    /// Text blocks emitted by the fixer, in order.
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub tool_call_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FixOutcome {
    pub fn completed(messages: Vec<String>, tool_call_count: u32) -> Self {
        Self {
            success: true,
            messages,
            tool_call_count,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// The external sub-steps a run drives. Fixed for the lifetime of a run.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub pre_actions: Vec<Arc<dyn Action>>,
    pub main_script: Option<Arc<dyn Action>>,
    pub validators: Vec<Arc<dyn Validator>>,
    pub fixer: Option<Arc<dyn Fixer>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre_action(mut self, action: impl Action) -> Self {
        self.pre_actions.push(Arc::new(action));
        self
    }

    pub fn with_main_script(mut self, action: impl Action) -> Self {
        self.main_script = Some(Arc::new(action));
        self
    }

    pub fn with_validator(mut self, validator: impl Validator) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn with_fixer(mut self, fixer: impl Fixer) -> Self {
        self.fixer = Some(Arc::new(fixer));
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field(
                "pre_actions",
                &self.pre_actions.iter().map(|a| a.description()).collect::<Vec<_>>(),
            )
            .field(
                "main_script",
                &self.main_script.as_ref().map(|a| a.description()),
            )
            .field(
                "validators",
                &self.validators.iter().map(|v| v.name()).collect::<Vec<_>>(),
            )
            .field("fixer", &self.fixer.is_some())
            .finish()
    }
}

/// The single state structure threaded through every step of a run.
#[derive(Debug, Clone)]
pub struct ConvergenceState {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub collaborators: Collaborators,

    // Environment
    pub working_directory: PathBuf,
    pub config_directory: Option<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
    pub system_prompt: Option<String>,

    // Pre-actions
    pub pre_actions_completed: bool,
    pub pre_actions_failed: bool,
    pub pre_action_results: Vec<ActionResult>,

    // Main script
    pub main_script_result: Option<ActionResult>,
    pub primary_task_succeeded: bool,

    // Loop control
    pub attempt: u32,
    max_attempts: u32,
    pub success: bool,

    // Condition checks
    pub validation_results: Vec<ValidationResult>,
    pub failed_checks: Vec<String>,
    pub failure_history: Vec<Vec<ValidationResult>>,

    // Fix step
    pub ai_response: Option<FixOutcome>,

    /// Free-form fields for custom steps, replaced key by key.
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl ConvergenceState {
    /// Fresh state for one run. `max_attempts` is clamped to at least 1.
    pub fn new(max_attempts: u32, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            collaborators: Collaborators::default(),
            working_directory: working_directory.into(),
            config_directory: None,
            env_vars: BTreeMap::new(),
            system_prompt: None,
            pre_actions_completed: false,
            pre_actions_failed: false,
            pre_action_results: Vec::new(),
            main_script_result: None,
            primary_task_succeeded: false,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            success: false,
            validation_results: Vec::new(),
            failed_checks: Vec::new(),
            failure_history: Vec::new(),
            ai_response: None,
            extras: BTreeMap::new(),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_config_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_directory = Some(dir.into());
        self
    }

    pub fn with_env_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env_vars = vars;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// The attempt budget. Never changes during a run.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True once the final allowed attempt has been used.
    pub fn budget_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts - 1
    }

    /// Merge a partial update: every set field replaces the current value.
    pub fn apply(&mut self, patch: StatePatch) {
        let StatePatch {
            pre_actions_completed,
            pre_actions_failed,
            pre_action_results,
            main_script_result,
            primary_task_succeeded,
            attempt,
            success,
            validation_results,
            failed_checks,
            failure_history,
            ai_response,
            extras,
        } = patch;

        if let Some(v) = pre_actions_completed {
            self.pre_actions_completed = v;
        }
        if let Some(v) = pre_actions_failed {
            self.pre_actions_failed = v;
        }
        if let Some(v) = pre_action_results {
            self.pre_action_results = v;
        }
        if let Some(v) = main_script_result {
            self.main_script_result = Some(v);
        }
        if let Some(v) = primary_task_succeeded {
            self.primary_task_succeeded = v;
        }
        if let Some(v) = attempt {
            self.attempt = v;
        }
        if let Some(v) = success {
            self.success = v;
        }
        if let Some(v) = validation_results {
            self.validation_results = v;
        }
        if let Some(v) = failed_checks {
            self.failed_checks = v;
        }
        if let Some(v) = failure_history {
            self.failure_history = v;
        }
        if let Some(v) = ai_response {
            self.ai_response = Some(v);
        }
        self.extras.extend(extras);
    }
}

/// A step's partial update. Unset fields leave the state unchanged.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub pre_actions_completed: Option<bool>,
    pub pre_actions_failed: Option<bool>,
    pub pre_action_results: Option<Vec<ActionResult>>,
    pub main_script_result: Option<ActionResult>,
    pub primary_task_succeeded: Option<bool>,
    pub attempt: Option<u32>,
    pub success: Option<bool>,
    pub validation_results: Option<Vec<ValidationResult>>,
    pub failed_checks: Option<Vec<String>>,
    pub failure_history: Option<Vec<Vec<ValidationResult>>>,
    pub ai_response: Option<FixOutcome>,
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl StatePatch {
    /// The no-op update.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set a free-form field.
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pre_actions_completed.is_none()
            && self.pre_actions_failed.is_none()
            && self.pre_action_results.is_none()
            && self.main_script_result.is_none()
            && self.primary_task_succeeded.is_none()
            && self.attempt.is_none()
            && self.success.is_none()
            && self.validation_results.is_none()
            && self.failed_checks.is_none()
            && self.failure_history.is_none()
            && self.ai_response.is_none()
            && self.extras.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let state = ConvergenceState::new(5, "/tmp/work");
        assert_eq!(state.attempt, 0);
        assert_eq!(state.max_attempts(), 5);
        assert!(!state.success);
        assert!(!state.primary_task_succeeded);
        assert!(state.failure_history.is_empty());
        assert!(!state.run_id.is_empty());
    }

    #[test]
    fn test_max_attempts_clamped() {
        let state = ConvergenceState::new(0, ".");
        assert_eq!(state.max_attempts(), 1);
        assert!(state.budget_exhausted());
    }

    #[test]
    fn test_apply_replaces_only_set_fields() {
        let mut state = ConvergenceState::new(3, ".");
        state.failed_checks = vec!["build".into()];

        state.apply(StatePatch {
            attempt: Some(2),
            success: Some(true),
            ..Default::default()
        });

        assert_eq!(state.attempt, 2);
        assert!(state.success);
        assert_eq!(state.failed_checks, vec!["build"]);
    }

    #[test]
    fn test_apply_replaces_lists_wholesale() {
        let mut state = ConvergenceState::new(3, ".");
        state.failure_history = vec![vec![ValidationResult::failed("a", "", Some(1))]];

        state.apply(StatePatch {
            failure_history: Some(vec![]),
            ..Default::default()
        });
        assert!(state.failure_history.is_empty());
    }

    #[test]
    fn test_extras_merge_by_key() {
        let mut state = ConvergenceState::new(1, ".");
        state.apply(StatePatch::empty().with_extra("a", serde_json::json!(1)));
        state.apply(
            StatePatch::empty()
                .with_extra("b", serde_json::json!("two"))
                .with_extra("a", serde_json::json!(3)),
        );
        assert_eq!(state.extras["a"], serde_json::json!(3));
        assert_eq!(state.extras["b"], serde_json::json!("two"));
    }

    #[test]
    fn test_empty_patch() {
        assert!(StatePatch::empty().is_empty());
        assert!(!StatePatch::empty()
            .with_extra("k", serde_json::json!(null))
            .is_empty());
        let patch = StatePatch {
            attempt: Some(1),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_budget_exhausted() {
        let mut state = ConvergenceState::new(3, ".");
        assert!(!state.budget_exhausted());
        state.attempt = 1;
        assert!(!state.budget_exhausted());
        state.attempt = 2;
        assert!(state.budget_exhausted());
    }

    #[test]
    fn test_fix_outcome_constructors() {
        let ok = FixOutcome::completed(vec!["done".into()], 4);
        assert!(ok.success);
        assert_eq!(ok.tool_call_count, 4);
        let err = FixOutcome::failed("no provider");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("no provider"));
    }
}
