use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConvergeError, Result};
use crate::spec::GraphSpec;

/// Top-level convergence run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Name of this configuration.
    pub name: String,
    /// Attempt budget for the retry loop.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Directory commands run in, relative to the caller's cwd.
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Inline system prompt for the fixer. `agent.system_prompt_file` wins if both are set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub pre_actions: Vec<PreActionConfig>,
    #[serde(default)]
    pub main_script: Option<MainScriptConfig>,
    #[serde(default)]
    pub validators: Vec<ValidatorConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Custom workflow; the built-in retry loop is used when absent.
    #[serde(default)]
    pub workflow: Option<GraphSpec>,
    /// Directory the config was loaded from. Set by `load`.
    #[serde(skip)]
    pub config_dir: Option<PathBuf>,
}

/// A setup command run once before the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreActionConfig {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl PreActionConfig {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }
}

/// The primary task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainScriptConfig {
    pub command: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_main_script_timeout")]
    pub timeout_secs: u64,
}

impl MainScriptConfig {
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.command)
    }
}

/// One condition check, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ValidatorConfig {
    Command {
        name: String,
        command: String,
        #[serde(default = "default_command_timeout")]
        timeout_secs: u64,
        #[serde(default = "default_command_capture_lines")]
        capture_lines: usize,
    },
    GitConflict {
        #[serde(default = "default_git_conflict_name")]
        name: String,
        #[serde(default = "default_git_conflict_timeout")]
        timeout_secs: u64,
    },
    TestSuite {
        name: String,
        command: String,
        #[serde(default = "default_test_suite_timeout")]
        timeout_secs: u64,
        #[serde(default = "default_test_suite_capture_lines")]
        capture_lines: usize,
    },
}

impl ValidatorConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Command { name, .. } | Self::GitConflict { name, .. } | Self::TestSuite { name, .. } => name,
        }
    }
}

/// External coding agent used by the fix step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI executable.
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default = "default_agent_model")]
    pub model: String,
    /// Extra arguments appended to the agent invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Custom system prompt file; relative paths resolve against the config directory.
    #[serde(default)]
    pub system_prompt_file: Option<String>,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            model: default_agent_model(),
            args: Vec::new(),
            system_prompt_file: None,
            timeout_secs: default_agent_timeout(),
        }
    }
}

fn default_max_attempts() -> u32 { 10 }
fn default_working_directory() -> String { ".".to_string() }
fn default_main_script_timeout() -> u64 { 600 }
fn default_command_timeout() -> u64 { 600 }
fn default_command_capture_lines() -> usize { 100 }
fn default_git_conflict_name() -> String { "Git Conflict Check".to_string() }
fn default_git_conflict_timeout() -> u64 { 10 }
fn default_test_suite_timeout() -> u64 { 1800 }
fn default_test_suite_capture_lines() -> usize { 200 }
fn default_agent_program() -> String { "claude".to_string() }
fn default_agent_model() -> String { "claude-sonnet-4-5-20250929".to_string() }
fn default_agent_timeout() -> u64 { 1800 }

pub const MAX_ATTEMPTS_LIMIT: u32 = 1000;

impl ConvergenceConfig {
    /// Minimal config with defaults for everything but the name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: default_max_attempts(),
            working_directory: default_working_directory(),
            system_prompt: None,
            pre_actions: Vec::new(),
            main_script: None,
            validators: Vec::new(),
            agent: AgentConfig::default(),
            workflow: None,
            config_dir: None,
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConvergeError::ConfigNotFound(path.display().to_string()))?;

        let mut config = Self::parse(&content)?;
        config.config_dir = path
            .parent()
            .map(|p| if p.as_os_str().is_empty() { PathBuf::from(".") } else { p.to_path_buf() });
        debug!(path = %path.display(), name = %config.name, "Loaded convergence config");
        Ok(config)
    }

    /// Parse and validate config text.
    ///
    /// `${ENV_VAR}` references in the agent settings and `working_directory` are
    /// expanded against the process environment. Command templates are left
    /// untouched; their `${VAR}` references are filled per run from the run's
    /// variables.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| ConvergeError::Config(e.to_string()))?;
        config.expand_environment();
        config.validate()?;
        Ok(config)
    }

    fn expand_environment(&mut self) {
        self.working_directory = expand_env_vars(&self.working_directory);
        let agent = &mut self.agent;
        agent.program = expand_env_vars(&agent.program);
        agent.model = expand_env_vars(&agent.model);
        for arg in &mut agent.args {
            *arg = expand_env_vars(arg);
        }
        if let Some(file) = &mut agent.system_prompt_file {
            *file = expand_env_vars(file);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConvergeError::Config("name must not be empty".into()));
        }
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(ConvergeError::Config(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {}",
                self.max_attempts
            )));
        }
        for (i, action) in self.pre_actions.iter().enumerate() {
            if action.command.trim().is_empty() {
                return Err(ConvergeError::Config(format!(
                    "pre_actions[{i}].command must not be empty"
                )));
            }
        }
        if let Some(main) = &self.main_script {
            if main.command.trim().is_empty() {
                return Err(ConvergeError::Config(
                    "main_script.command must not be empty".into(),
                ));
            }
        }
        for v in &self.validators {
            if v.name().trim().is_empty() {
                return Err(ConvergeError::Config("validator name must not be empty".into()));
            }
            if let ValidatorConfig::Command { command, .. } | ValidatorConfig::TestSuite { command, .. } = v {
                if command.trim().is_empty() {
                    return Err(ConvergeError::Config(format!(
                        "validator '{}' has an empty command",
                        v.name()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Working directory, resolved against `base` when relative.
    pub fn working_dir(&self, base: &Path) -> PathBuf {
        let wd = Path::new(&self.working_directory);
        if wd.is_absolute() {
            wd.to_path_buf()
        } else {
            base.join(wd)
        }
    }

    /// Resolve the custom system prompt: the prompt file if configured, else the inline prompt.
    pub fn resolve_system_prompt(&self) -> Result<Option<String>> {
        let Some(file) = &self.agent.system_prompt_file else {
            return Ok(self.system_prompt.clone());
        };
        let mut path = PathBuf::from(file);
        if path.is_relative() {
            if let Some(dir) = &self.config_dir {
                path = dir.join(path);
            }
        }
        std::fs::read_to_string(&path).map(Some).map_err(|e| {
            ConvergeError::Config(format!(
                "cannot read system prompt file {}: {e}",
                path.display()
            ))
        })
    }
}

/// Expand `${VAR}` references against the process environment.
/// Unset variables and an unterminated `${` are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let var_name = &after[..end];
        match std::env::var(var_name) {
            Ok(val) => result.push_str(&val),
            Err(_) => result.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}
