use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use reconverge_core::config::AgentConfig;
use reconverge_core::state::{FixOutcome, FixRequest};
use reconverge_core::traits::Fixer;

use crate::exec::{run_process, tail_chars};

/// Where the agent's model is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    Vertex,
}

impl Provider {
    /// Pick a provider from the credential variables. Empty values count as unset.
    pub fn detect(api_key: Option<&str>, vertex_project: Option<&str>) -> Result<Self, String> {
        let set = |v: Option<&str>| v.is_some_and(|s| !s.trim().is_empty());
        if set(api_key) {
            Ok(Provider::Anthropic)
        } else if set(vertex_project) {
            Ok(Provider::Vertex)
        } else {
            Err("Neither ANTHROPIC_API_KEY nor ANTHROPIC_VERTEX_PROJECT_ID is set. \
                 Set ANTHROPIC_API_KEY for the Anthropic API or \
                 ANTHROPIC_VERTEX_PROJECT_ID for Google Vertex AI."
                .to_string())
        }
    }

    fn from_env() -> Result<Self, String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        let vertex = std::env::var("ANTHROPIC_VERTEX_PROJECT_ID").ok();
        Self::detect(api_key.as_deref(), vertex.as_deref())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Anthropic => "anthropic",
            Provider::Vertex => "vertex",
        }
    }
}

/// Drives an external coding-agent CLI in print mode with streamed JSON output.
pub struct AgentFixer {
    program: String,
    model: String,
    args: Vec<String>,
    timeout: Duration,
    provider: Option<Provider>,
}

impl AgentFixer {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(1800),
            provider: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            program: config.program.clone(),
            model: config.model.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            provider: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use a fixed provider instead of detecting one from the environment.
    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    fn command(&self, request: &FixRequest) -> Command {
        let prompt = format!("{}\n\n{}", request.system_prompt, request.user_message);
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p")
            .arg(prompt)
            .args(["--output-format", "stream-json", "--verbose"])
            .arg("--model")
            .arg(&self.model)
            .args(["--permission-mode", "bypassPermissions"])
            .args(&self.args)
            .current_dir(&request.working_dir);
        cmd
    }
}

impl Fixer for AgentFixer {
    fn fix(&self, request: FixRequest) -> BoxFuture<'_, FixOutcome> {
        Box::pin(async move {
            let detected = match self.provider {
                Some(p) => Ok(p),
                None => Provider::from_env(),
            };
            let provider = match detected {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Agent initialization failed");
                    return FixOutcome::failed(e);
                }
            };

            info!(
                provider = provider.as_str(),
                model = %self.model,
                program = %self.program,
                "Invoking agent"
            );
            debug!(system_prompt = %request.system_prompt, user_message = %request.user_message, "Agent context");

            let out = run_process(self.command(&request), self.timeout).await;
            let stream = parse_stream(&out.stdout);

            let error = if out.timed_out {
                Some(format!("Agent timed out after {} seconds", self.timeout.as_secs()))
            } else if !out.success() {
                Some(format!(
                    "Agent exited with code {}: {}",
                    out.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
                    tail_chars(out.stderr.trim(), 2000)
                ))
            } else {
                stream.error
            };

            info!(
                tool_calls = stream.tool_call_count,
                messages = stream.messages.len(),
                failed = error.is_some(),
                "Agent finished"
            );

            FixOutcome {
                success: error.is_none(),
                messages: stream.messages,
                tool_call_count: stream.tool_call_count,
                error,
            }
        })
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct StreamSummary {
    pub messages: Vec<String>,
    pub tool_call_count: u32,
    pub error: Option<String>,
}

/// Fold the agent's JSON-lines output: collect text blocks, count tool uses,
/// and pick up an error from the final result record.
pub(crate) fn parse_stream(stdout: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let event: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                debug!(line = %line, "Skipping non-JSON agent output");
                continue;
            }
        };

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let blocks = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for block in blocks {
                    match block.get("type").and_then(Value::as_str) {
                        Some("text") => {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                info!(text = %text, "Agent says");
                                summary.messages.push(text.to_string());
                            }
                        }
                        Some("tool_use") => {
                            summary.tool_call_count += 1;
                            let name = block.get("name").and_then(Value::as_str).unwrap_or("?");
                            info!(tool = %name, "Agent using tool");
                        }
                        Some("thinking") => debug!("Agent thinking"),
                        _ => {}
                    }
                }
            }
            Some("result") => {
                if event.get("is_error").and_then(Value::as_bool) == Some(true) {
                    let detail = event
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or("agent reported an error");
                    summary.error = Some(detail.to_string());
                }
            }
            _ => {}
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_provider() {
        assert_eq!(Provider::detect(Some("sk-x"), None), Ok(Provider::Anthropic));
        assert_eq!(Provider::detect(Some("sk-x"), Some("proj")), Ok(Provider::Anthropic));
        assert_eq!(Provider::detect(None, Some("proj")), Ok(Provider::Vertex));
        assert_eq!(Provider::detect(Some(""), Some("proj")), Ok(Provider::Vertex));
        let err = Provider::detect(None, Some("  ")).unwrap_err();
        assert!(err.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_parse_stream() {
        let stdout = r#"{"type":"system","subtype":"init"}
{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the build"},{"type":"tool_use","name":"Bash","input":{"command":"make"}}]}}
not json
{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{}},{"type":"text","text":"Fixed the import"}]}}
{"type":"result","is_error":false,"result":"done"}
"#;
        let summary = parse_stream(stdout);
        assert_eq!(summary.messages, vec!["Looking at the build", "Fixed the import"]);
        assert_eq!(summary.tool_call_count, 2);
        assert!(summary.error.is_none());
    }

    #[test]
    fn test_parse_stream_error_result() {
        let stdout = r#"{"type":"result","is_error":true,"result":"rate limited"}"#;
        assert_eq!(parse_stream(stdout).error.as_deref(), Some("rate limited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_agent_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"ok\"},{\"type\":\"tool_use\",\"name\":\"Bash\"}]}}'\n\
             echo '{\"type\":\"result\",\"is_error\":false}'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let fixer = AgentFixer::new(script.display().to_string(), "test-model")
            .with_provider(Provider::Anthropic);
        let outcome = fixer
            .fix(FixRequest {
                system_prompt: "sys".into(),
                user_message: "fix it".into(),
                working_dir: dir.path().to_path_buf(),
            })
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.messages, vec!["ok"]);
        assert_eq!(outcome.tool_call_count, 1);
    }
}
