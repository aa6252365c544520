use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::{Captures, Regex};
use tracing::debug;

use reconverge_core::state::ActionResult;
use reconverge_core::traits::{Action, ActionContext};

use crate::exec::{run_shell, tail_chars};

/// Streams kept from a pre-action, in characters.
const PRE_ACTION_TAIL: usize = 1000;
/// Streams kept from the main script, in characters.
const MAIN_SCRIPT_TAIL: usize = 30_000;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{(\w+)\}").expect("static pattern"))
}

/// Replace `${VAR}` with `vars["VAR"]`. Unknown variables are left unchanged.
pub fn substitute_vars(text: &str, vars: &BTreeMap<String, String>) -> String {
    var_pattern()
        .replace_all(text, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// A shell command run as a pre-action or as the main script.
pub struct CommandAction {
    command: String,
    description: String,
    timeout: Duration,
    tail: usize,
}

impl CommandAction {
    /// A setup command: 600 s timeout, last 1000 characters of each stream kept.
    pub fn pre_action(command: impl Into<String>, description: Option<String>) -> Self {
        let command = command.into();
        Self {
            description: description.unwrap_or_else(|| command.clone()),
            command,
            timeout: Duration::from_secs(600),
            tail: PRE_ACTION_TAIL,
        }
    }

    /// The primary task.
    pub fn main_script(
        command: impl Into<String>,
        description: Option<String>,
        timeout_secs: u64,
    ) -> Self {
        let command = command.into();
        Self {
            description: description.unwrap_or_else(|| command.clone()),
            command,
            timeout: Duration::from_secs(timeout_secs),
            tail: MAIN_SCRIPT_TAIL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl Action for CommandAction {
    fn description(&self) -> &str {
        &self.description
    }

    fn run<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ActionResult> {
        Box::pin(async move {
            let expanded = substitute_vars(&self.command, ctx.env_vars());
            debug!(action = %self.description, command = %expanded, "Running action");

            let out = run_shell(&expanded, ctx.working_dir, self.timeout).await;

            let mut metadata = BTreeMap::new();
            metadata.insert("command".to_string(), serde_json::json!(expanded));
            if out.timed_out {
                metadata.insert("timeout".to_string(), serde_json::json!(true));
            }

            ActionResult {
                action: self.description.clone(),
                success: out.success(),
                output: tail_chars(&out.stdout, self.tail),
                stderr: tail_chars(&out.stderr, self.tail),
                exit_code: out.exit_code,
                duration_ms: out.duration_ms,
                metadata,
            }
        })
    }
}
