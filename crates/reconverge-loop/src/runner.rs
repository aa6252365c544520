//! Run API: wire a config into collaborators, build the initial state,
//! compile the workflow, and drive it to completion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use reconverge_core::config::ConvergenceConfig;
use reconverge_core::error::Result;
use reconverge_core::spec::GraphSpec;
use reconverge_core::state::{ActionResult, Collaborators, ConvergenceState, ValidationResult};
use reconverge_core::traits::Action;
use reconverge_graph::{
    CompiledGraph, ExecutionEngine, GraphCompiler, RoutingRegistry, StepRegistry,
};

use crate::actions::CommandAction;
use crate::fixer::AgentFixer;
use crate::{builtin_routes, builtin_steps, default_topology, validators};

/// Caller overrides for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Variables available to `${VAR}` substitution. `CURRENT_TIME` and
    /// `WORKING_DIR` are filled in when absent.
    pub env_vars: BTreeMap<String, String>,
    /// Replaces the configured working directory.
    pub working_directory: Option<PathBuf>,
    /// Replaces the configured custom system prompt.
    pub system_prompt: Option<String>,
    /// Replaces the default step ceiling.
    pub step_limit: Option<usize>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceReport {
    pub run_id: String,
    pub config_name: String,
    /// True when the primary task ended up succeeding.
    pub success: bool,
    /// Attempts counted by the loop (zero-based index of the last one).
    pub attempts: u32,
    pub max_attempts: u32,
    pub working_directory: PathBuf,
    pub pre_actions_failed: bool,
    pub pre_action_results: Vec<ActionResult>,
    pub main_script_result: Option<ActionResult>,
    pub validation_results: Vec<ValidationResult>,
    pub failure_history: Vec<Vec<ValidationResult>>,
    /// Step names in execution order.
    pub visited: Vec<String>,
    pub elapsed_ms: u64,
    /// The final state, for callers that need more than the summary.
    #[serde(skip)]
    pub state: ConvergenceState,
}

/// Owns the step and routing registries plus the engine.
pub struct ConvergenceRunner {
    steps: StepRegistry,
    routes: RoutingRegistry,
    engine: ExecutionEngine,
}

impl ConvergenceRunner {
    /// Runner with every built-in step type and routing function registered.
    pub fn new() -> Self {
        Self {
            steps: builtin_steps(),
            routes: builtin_routes(),
            engine: ExecutionEngine::new(),
        }
    }

    /// Register custom step types here.
    pub fn steps_mut(&mut self) -> &mut StepRegistry {
        &mut self.steps
    }

    /// Register custom routing functions here.
    pub fn routes_mut(&mut self) -> &mut RoutingRegistry {
        &mut self.routes
    }

    pub fn with_engine(mut self, engine: ExecutionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.engine = self.engine.with_step_limit(limit);
        self
    }

    /// Compile `workflow`, or the default topology when `None`.
    pub fn compile(&self, workflow: Option<&GraphSpec>) -> Result<CompiledGraph> {
        let compiler = GraphCompiler::new(&self.steps, &self.routes);
        match workflow {
            Some(spec) => compiler.compile(spec),
            None => compiler.compile(&default_topology()),
        }
    }

    /// Drive a compiled graph to completion.
    pub async fn execute(
        &self,
        graph: &CompiledGraph,
        state: ConvergenceState,
    ) -> Result<ConvergenceReport> {
        let result = self.engine.run_traced(graph, state).await?;
        Ok(report(String::new(), result.state, result.visited, result.total_elapsed_ms))
    }

    /// Compile and run in one go.
    pub async fn run(
        &self,
        workflow: Option<&GraphSpec>,
        state: ConvergenceState,
    ) -> Result<ConvergenceReport> {
        let graph = self.compile(workflow)?;
        self.execute(&graph, state).await
    }
}

impl Default for ConvergenceRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn report(
    config_name: String,
    state: ConvergenceState,
    visited: Vec<String>,
    elapsed_ms: u64,
) -> ConvergenceReport {
    ConvergenceReport {
        run_id: state.run_id.clone(),
        config_name,
        success: state.primary_task_succeeded,
        attempts: state.attempt,
        max_attempts: state.max_attempts(),
        working_directory: state.working_directory.clone(),
        pre_actions_failed: state.pre_actions_failed,
        pre_action_results: state.pre_action_results.clone(),
        main_script_result: state.main_script_result.clone(),
        validation_results: state.validation_results.clone(),
        failure_history: state.failure_history.clone(),
        visited,
        elapsed_ms,
        state,
    }
}

/// Shell-command collaborators and the agent fixer described by `config`.
pub fn collaborators_from_config(config: &ConvergenceConfig) -> Collaborators {
    Collaborators {
        pre_actions: config
            .pre_actions
            .iter()
            .map(|a| {
                Arc::new(CommandAction::pre_action(a.command.clone(), a.description.clone()))
                    as Arc<dyn Action>
            })
            .collect(),
        main_script: config.main_script.as_ref().map(|m| {
            Arc::new(CommandAction::main_script(
                m.command.clone(),
                m.description.clone(),
                m.timeout_secs,
            )) as Arc<dyn Action>
        }),
        validators: config.validators.iter().map(validators::from_config).collect(),
        fixer: Some(Arc::new(AgentFixer::from_config(&config.agent))),
    }
}

fn absolute(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Fresh state for a run of `config`.
///
/// The working directory is made absolute against the process cwd, the config
/// directory is recorded for pre-actions, and the custom system prompt is
/// resolved (option, then prompt file, then inline prompt).
pub fn initial_state(
    config: &ConvergenceConfig,
    options: &RunOptions,
    collaborators: Collaborators,
) -> Result<ConvergenceState> {
    let cwd = std::env::current_dir()?;
    let working_dir = match &options.working_directory {
        Some(dir) => absolute(dir, &cwd),
        None => config.working_dir(&cwd),
    };

    let mut env_vars = options.env_vars.clone();
    env_vars
        .entry("CURRENT_TIME".to_string())
        .or_insert_with(|| chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
    env_vars
        .entry("WORKING_DIR".to_string())
        .or_insert_with(|| working_dir.display().to_string());

    let system_prompt = match &options.system_prompt {
        Some(prompt) => Some(prompt.clone()),
        None => config.resolve_system_prompt()?,
    };

    let mut state = ConvergenceState::new(config.max_attempts, working_dir)
        .with_collaborators(collaborators)
        .with_env_vars(env_vars);
    if let Some(dir) = &config.config_dir {
        state = state.with_config_directory(absolute(dir, &cwd));
    }
    if let Some(prompt) = system_prompt {
        state = state.with_system_prompt(prompt);
    }
    Ok(state)
}

/// Run `config` end to end with the built-in step types and routing functions.
pub async fn run_convergence(
    config: &ConvergenceConfig,
    options: RunOptions,
) -> Result<ConvergenceReport> {
    config.validate()?;

    let mut runner = ConvergenceRunner::new();
    if let Some(limit) = options.step_limit {
        runner = runner.with_step_limit(limit);
    }
    let graph = runner.compile(config.workflow.as_ref())?;

    let state = initial_state(config, &options, collaborators_from_config(config))?;
    info!(
        config = %config.name,
        run_id = %state.run_id,
        max_attempts = state.max_attempts(),
        working_dir = %state.working_directory.display(),
        pre_actions = config.pre_actions.len(),
        validators = config.validators.len(),
        custom_workflow = config.workflow.is_some(),
        "Starting convergence run"
    );

    let mut report = runner.execute(&graph, state).await?;
    report.config_name = config.name.clone();

    info!(
        success = report.success,
        attempts = report.attempts,
        steps = report.visited.len(),
        elapsed_ms = report.elapsed_ms,
        "Convergence run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconverge_core::config::{MainScriptConfig, PreActionConfig, ValidatorConfig};
    use reconverge_core::spec::{END, START};
    use reconverge_core::traits::FnStep;
    use reconverge_core::state::StatePatch;
    use reconverge_test_utils::{
        state_with, temp_workdir, CountingFixer, ScriptedAction, ScriptedValidator,
    };

    #[tokio::test]
    async fn test_fails_after_budget_with_failing_checks() {
        let dir = temp_workdir();
        let main = ScriptedAction::failing("make");
        let validator = ScriptedValidator::failing("Build");
        let fixer = CountingFixer::new();
        let (main_calls, fix_calls, check_calls) =
            (main.calls(), fixer.calls(), validator.calls());
        let state = state_with(
            3,
            dir.path(),
            Collaborators::new()
                .with_main_script(main)
                .with_validator(validator)
                .with_fixer(fixer),
        );

        let report = ConvergenceRunner::new().run(None, state).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.failure_history.len(), 3);
        assert_eq!(main_calls.get(), 1);
        assert_eq!(fix_calls.get(), 3);
        assert_eq!(check_calls.get(), 3);
        assert_eq!(report.visited.len(), 13);
        assert_eq!(report.visited.first().map(String::as_str), Some("pre_actions"));
        assert_eq!(report.visited.last().map(String::as_str), Some("decide"));
    }

    #[tokio::test]
    async fn test_main_script_success_ends_immediately() {
        let dir = temp_workdir();
        let fixer = CountingFixer::new();
        let fix_calls = fixer.calls();
        let state = state_with(
            5,
            dir.path(),
            Collaborators::new()
                .with_main_script(ScriptedAction::succeeding("make"))
                .with_fixer(fixer),
        );
        let report = ConvergenceRunner::new().run(None, state).await.unwrap();
        assert!(report.success);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.visited, vec!["pre_actions", "run_main_script"]);
        assert_eq!(fix_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_converges_after_fix() {
        let dir = temp_workdir();
        let main = ScriptedAction::sequence("rebase", vec![false, true]);
        let main_calls = main.calls();
        let state = state_with(
            5,
            dir.path(),
            Collaborators::new()
                .with_main_script(main)
                .with_validator(ScriptedValidator::passing("Build"))
                .with_fixer(CountingFixer::new()),
        );
        let report = ConvergenceRunner::new().run(None, state).await.unwrap();
        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(main_calls.get(), 2);
        assert!(report.failure_history.is_empty());
        assert_eq!(
            report.visited,
            vec![
                "pre_actions",
                "run_main_script",
                "ai_fix",
                "validate",
                "decide",
                "increment_attempt",
                "run_main_script"
            ]
        );
    }

    #[tokio::test]
    async fn test_pre_action_failure_stops_run() {
        let dir = temp_workdir();
        let main = ScriptedAction::succeeding("make");
        let main_calls = main.calls();
        let state = state_with(
            3,
            dir.path(),
            Collaborators::new()
                .with_pre_action(ScriptedAction::failing("fetch"))
                .with_main_script(main),
        );
        let report = ConvergenceRunner::new().run(None, state).await.unwrap();
        assert!(!report.success);
        assert!(report.pre_actions_failed);
        assert_eq!(report.visited, vec!["pre_actions"]);
        assert_eq!(main_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_custom_step_type() {
        let dir = temp_workdir();
        let mut runner = ConvergenceRunner::new();
        runner.steps_mut().register(
            "mark",
            FnStep::new("mark the run", |_s: &ConvergenceState| {
                Ok(StatePatch::empty().with_extra("marked", serde_json::json!(true)))
            }),
        );
        let workflow = GraphSpec::new()
            .step("mark", "mark")
            .step("main", "run_main_script")
            .edge(START, "mark")
            .edge("mark", "main")
            .edge("main", END);

        let state = state_with(
            1,
            dir.path(),
            Collaborators::new().with_main_script(ScriptedAction::succeeding("make")),
        );
        let report = runner.run(Some(&workflow), state).await.unwrap();
        assert!(report.success);
        assert_eq!(report.visited, vec!["mark", "main"]);
        assert_eq!(report.state.extras["marked"], serde_json::json!(true));
    }

    #[test]
    fn test_collaborators_from_config() {
        let mut config = ConvergenceConfig::named("demo");
        config.pre_actions = vec![PreActionConfig {
            command: "git fetch".into(),
            description: Some("Fetch".into()),
        }];
        config.main_script = Some(MainScriptConfig {
            command: "make".into(),
            description: None,
            timeout_secs: 60,
        });
        config.validators = vec![ValidatorConfig::GitConflict {
            name: "Conflicts".into(),
            timeout_secs: 10,
        }];

        let collaborators = collaborators_from_config(&config);
        assert_eq!(collaborators.pre_actions[0].description(), "Fetch");
        assert_eq!(collaborators.main_script.as_ref().unwrap().description(), "make");
        assert_eq!(collaborators.validators[0].name(), "Conflicts");
        assert!(collaborators.fixer.is_some());
    }

    #[test]
    fn test_initial_state_env_vars() {
        let dir = temp_workdir();
        let config = ConvergenceConfig::named("demo");
        let mut options = RunOptions {
            working_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        options.env_vars.insert("K8S_TAG".into(), "v1.35.0".into());

        let state = initial_state(&config, &options, Collaborators::new()).unwrap();
        assert_eq!(state.working_directory, dir.path());
        assert_eq!(state.env_vars["K8S_TAG"], "v1.35.0");
        assert_eq!(state.env_vars["WORKING_DIR"], dir.path().display().to_string());
        assert_eq!(state.env_vars["CURRENT_TIME"].len(), "2025-01-01 00:00:00".len());
        assert_eq!(state.max_attempts(), 10);
    }

    #[test]
    fn test_initial_state_keeps_caller_time() {
        let config = ConvergenceConfig::named("demo");
        let mut options = RunOptions::default();
        options.env_vars.insert("CURRENT_TIME".into(), "then".into());
        options.system_prompt = Some("override".into());
        let state = initial_state(&config, &options, Collaborators::new()).unwrap();
        assert_eq!(state.env_vars["CURRENT_TIME"], "then");
        assert_eq!(state.system_prompt.as_deref(), Some("override"));
        assert!(state.working_directory.is_absolute());
    }

    #[tokio::test]
    async fn test_run_convergence_with_shell_commands() {
        let dir = temp_workdir();
        let mut config = ConvergenceConfig::named("shell");
        config.max_attempts = 2;
        config.pre_actions = vec![PreActionConfig {
            command: "echo ${GREETING} > greeting.txt".into(),
            description: None,
        }];
        config.main_script = Some(MainScriptConfig {
            command: "test -f greeting.txt".into(),
            description: Some("Greeting exists".into()),
            timeout_secs: 30,
        });
        config.config_dir = Some(dir.path().to_path_buf());

        let mut options = RunOptions {
            working_directory: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        options.env_vars.insert("GREETING".into(), "hello".into());

        let report = run_convergence(&config, options).await.unwrap();
        assert!(report.success);
        assert_eq!(report.config_name, "shell");
        assert_eq!(report.pre_action_results.len(), 1);
        let greeting = std::fs::read_to_string(dir.path().join("greeting.txt")).unwrap();
        assert_eq!(greeting.trim(), "hello");
    }
}
