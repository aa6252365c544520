use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{info, warn};

use reconverge_core::state::{ActionResult, ConvergenceState};
use reconverge_core::traits::{Action, ActionContext};

/// Collects text a callable prints. Becomes the head of its `output`.
#[derive(Debug, Clone, Default)]
pub struct OutputSink(Arc<Mutex<String>>);

impl OutputSink {
    pub fn println(&self, line: impl AsRef<str>) {
        let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        buf.push_str(line.as_ref());
        buf.push('\n');
    }

    pub fn contents(&self) -> String {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Everything a callable receives.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub working_dir: PathBuf,
    pub config_dir: Option<PathBuf>,
    pub env_vars: BTreeMap<String, String>,
    /// Snapshot of the run state when the callable started.
    pub state: ConvergenceState,
    pub output: OutputSink,
}

pub(crate) type CallableFn =
    Arc<dyn Fn(CallContext) -> BoxFuture<'static, anyhow::Result<Option<String>>> + Send + Sync>;

pub(crate) fn boxed<F, Fut>(f: F) -> CallableFn
where
    F: Fn(CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

pub(crate) struct CallOutcome {
    pub success: bool,
    pub output: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Run a callable with a timeout. Errors and timeouts become data:
/// exit code 0 on success, 1 on error, `None` on timeout.
pub(crate) async fn invoke(
    name: &str,
    f: &CallableFn,
    ctx: ActionContext<'_>,
    timeout: Duration,
) -> CallOutcome {
    let sink = OutputSink::default();
    let call_ctx = CallContext {
        working_dir: ctx.working_dir.to_path_buf(),
        config_dir: ctx.config_dir().map(|p| p.to_path_buf()),
        env_vars: ctx.env_vars().clone(),
        state: ctx.state.clone(),
        output: sink.clone(),
    };

    info!(callable = %name, "Executing callable");
    let start = Instant::now();
    let result = tokio::time::timeout(timeout, f(call_ctx)).await;
    let duration_ms = start.elapsed().as_millis() as u64;
    let printed = sink.contents();

    match result {
        Ok(Ok(returned)) => {
            let mut parts = Vec::new();
            let printed = printed.trim_end();
            if !printed.is_empty() {
                parts.push(printed.to_string());
            }
            if let Some(text) = returned {
                parts.push(text);
            }
            CallOutcome {
                success: true,
                output: parts.join("\n"),
                stderr: String::new(),
                exit_code: Some(0),
                duration_ms,
            }
        }
        Ok(Err(e)) => {
            warn!(callable = %name, error = %e, duration_ms, "Callable failed");
            CallOutcome {
                success: false,
                output: printed,
                stderr: format!("{:#}", e),
                exit_code: Some(1),
                duration_ms,
            }
        }
        Err(_) => {
            let message = format!(
                "Callable {} timed out after {} seconds",
                name,
                timeout.as_secs()
            );
            warn!(callable = %name, "{}", message);
            CallOutcome {
                success: false,
                output: printed,
                stderr: message,
                exit_code: None,
                duration_ms,
            }
        }
    }
}

/// An async closure run as a pre-action or as the main script.
pub struct CallableAction {
    description: String,
    f: CallableFn,
    timeout: Duration,
}

impl CallableAction {
    pub fn new<F, Fut>(description: impl Into<String>, f: F) -> Self
    where
        F: Fn(CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        Self {
            description: description.into(),
            f: boxed(f),
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Action for CallableAction {
    fn description(&self) -> &str {
        &self.description
    }

    fn run<'a>(&'a self, ctx: ActionContext<'a>) -> BoxFuture<'a, ActionResult> {
        Box::pin(async move {
            let outcome = invoke(&self.description, &self.f, ctx, self.timeout).await;
            ActionResult {
                action: self.description.clone(),
                success: outcome.success,
                output: outcome.output,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                metadata: BTreeMap::new(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_printed_and_returned_output() {
        let action = CallableAction::new("setup", |ctx: CallContext| async move {
            ctx.output.println("preparing");
            Ok::<_, anyhow::Error>(Some(format!("done in {}", ctx.working_dir.display())))
        });
        let state = ConvergenceState::new(1, "/work");
        let result = action.run(ActionContext::new(Path::new("/work"), &state)).await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.output, "preparing\ndone in /work");
    }

    #[tokio::test]
    async fn test_error_becomes_stderr() {
        let action = CallableAction::new("broken", |ctx: CallContext| async move {
            ctx.output.println("partial");
            Err::<Option<String>, _>(anyhow::anyhow!("disk full"))
        });
        let state = ConvergenceState::new(1, ".");
        let result = action.run(ActionContext::new(Path::new("."), &state)).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("disk full"));
        assert_eq!(result.output, "partial\n");
    }

    #[tokio::test]
    async fn test_timeout_has_no_exit_code() {
        let action = CallableAction::new("slow", |_ctx: CallContext| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<Option<String>, anyhow::Error>(None)
        })
        .with_timeout(Duration::from_millis(50));
        let state = ConvergenceState::new(1, ".");
        let result = action.run(ActionContext::new(Path::new("."), &state)).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_receives_env_and_config_dir() {
        let action = CallableAction::new("inspect", |ctx: CallContext| async move {
            let tag = ctx.env_vars.get("TAG").cloned().unwrap_or_default();
            let dir = ctx.config_dir.map(|d| d.display().to_string()).unwrap_or_default();
            Ok::<_, anyhow::Error>(Some(format!("{tag}@{dir}")))
        });
        let mut vars = BTreeMap::new();
        vars.insert("TAG".to_string(), "v1".to_string());
        let state = ConvergenceState::new(1, ".")
            .with_env_vars(vars)
            .with_config_directory("/etc/reconverge");
        let result = action.run(ActionContext::new(Path::new("."), &state)).await;
        assert_eq!(result.output, "v1@/etc/reconverge");
    }
}
