use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

/// Captured result of a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process timed out, failed to spawn, or died to a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `command` through `sh -c` in `cwd`, killing it after `timeout`.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> ProcessOutput {
    debug!(command = %command, cwd = %cwd.display(), "Running shell command");
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).current_dir(cwd);
    run_process(cmd, timeout).await
}

/// Run a prepared command with captured output and a hard timeout.
pub async fn run_process(mut cmd: Command, timeout: Duration) -> ProcessOutput {
    let start = Instant::now();
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let result = tokio::time::timeout(timeout, cmd.output()).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            duration_ms,
            timed_out: false,
        },
        Ok(Err(e)) => ProcessOutput {
            stderr: format!("Failed to start process: {}", e),
            duration_ms,
            ..Default::default()
        },
        Err(_) => ProcessOutput {
            stderr: format!("Command timed out after {} seconds", timeout.as_secs()),
            duration_ms,
            timed_out: true,
            ..Default::default()
        },
    }
}

/// Keep the last `max` characters.
pub fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Keep the last `max` lines.
pub fn tail_lines(text: &str, max: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= max {
        return text.to_string();
    }
    lines[lines.len() - max..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let out = run_shell("echo hello; echo oops >&2; exit 3", Path::new("."), Duration::from_secs(10)).await;
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run_shell("ls", dir.path(), Duration::from_secs(10)).await;
        assert!(out.success());
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_timeout_has_no_exit_code() {
        let out = run_shell("sleep 5", Path::new("."), Duration::from_millis(100)).await;
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(out.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let out = run_shell("true", Path::new("/nonexistent/reconverge/dir"), Duration::from_secs(5)).await;
        assert_eq!(out.exit_code, None);
        assert!(!out.timed_out);
        assert!(out.stderr.contains("Failed to start"));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\nd", 2), "c\nd");
        assert_eq!(tail_lines("a\nb", 5), "a\nb");
        assert_eq!(tail_lines("", 3), "");
    }
}
