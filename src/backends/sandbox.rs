//! Sandboxed local process backend.
//!
//! Runs a command-line model client inside an isolation wrapper
//! (`firejail --private gemini <prompt>` by default) in the requester's
//! session directory. The child is registered with the job's cancellation
//! context so a stop request kills it.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::backends::Backend;
use crate::error::BackendError;
use crate::worker::cancel::{CancellationContext, KillHandle};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const EMPTY_OUTPUT: &str = "The sandbox produced no output.";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub program: String,
    /// Arguments placed before the prompt.
    pub args: Vec<String>,
    /// Mode label shown on replies.
    pub label: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            program: "firejail".to_string(),
            args: vec!["--private".to_string(), "gemini".to_string()],
            label: "Gemini CLI (Isolated)".to_string(),
        }
    }
}

pub struct SandboxBackend {
    config: SandboxConfig,
}

impl SandboxBackend {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn command(&self, prompt: &str, workdir: Option<&Path>) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Backend for SandboxBackend {
    fn label(&self) -> &str {
        &self.config.label
    }

    async fn generate(
        &self,
        prompt: &str,
        workdir: Option<&Path>,
        ctx: &CancellationContext,
    ) -> Result<Option<String>, BackendError> {
        if ctx.is_cancelled() {
            return Ok(None);
        }

        let child = self
            .command(prompt, workdir)
            .spawn()
            .map_err(|e| BackendError::SpawnFailed {
                program: self.config.program.clone(),
                reason: e.to_string(),
            })?;

        tracing::debug!(
            job_id = %ctx.job_id(),
            program = %self.config.program,
            pid = ?child.id(),
            "Sandbox process started"
        );

        let (handle, mut signal) = KillHandle::channel();
        ctx.attach_kill_handle(handle);

        // Dropping `wait_with_output` drops the child, and `kill_on_drop`
        // terminates it.
        let output = tokio::select! {
            biased;
            _ = signal.triggered() => {
                tracing::info!(job_id = %ctx.job_id(), "Sandbox process killed");
                return Ok(None);
            }
            output = child.wait_with_output() => output?,
        };

        if ctx.is_cancelled() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if !output.status.success() && stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::ProcessFailed {
                program: self.config.program.clone(),
                code: output.status.code(),
                stderr: truncate_output(stderr.trim()),
            });
        }

        if stdout.is_empty() {
            return Ok(Some(EMPTY_OUTPUT.to_string()));
        }
        Ok(Some(truncate_output(stdout)))
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::roles::AuthorityTier;
    use crate::worker::cancel::CancelReason;

    /// `sh -c <script> <prompt>`: the prompt arrives as `$0`.
    fn sh(script: &str) -> SandboxBackend {
        SandboxBackend::new(SandboxConfig {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            label: "test".into(),
        })
    }

    fn ctx() -> CancellationContext {
        CancellationContext::new(Uuid::new_v4(), AuthorityTier::Elevated)
    }

    #[test]
    fn default_wraps_cli_in_firejail() {
        let config = SandboxConfig::default();
        assert_eq!(config.program, "firejail");
        assert_eq!(config.args, vec!["--private", "gemini"]);
    }

    #[tokio::test]
    async fn prompt_is_passed_as_last_argument() {
        let out = sh("printf '%s' \"$0\"")
            .generate("hello world", None, &ctx())
            .await
            .unwrap();
        assert_eq!(out.as_deref(), Some("hello world"));
    }

    #[tokio::test]
    async fn runs_in_session_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = sh("pwd")
            .generate("x", Some(dir.path()), &ctx())
            .await
            .unwrap()
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(&out).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn failure_without_output_is_an_error() {
        let err = sh("echo oops >&2; exit 3")
            .generate("x", None, &ctx())
            .await
            .unwrap_err();
        match err {
            BackendError::ProcessFailed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_output_gets_placeholder() {
        let out = sh("true").generate("x", None, &ctx()).await.unwrap();
        assert_eq!(out.as_deref(), Some(EMPTY_OUTPUT));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let backend = SandboxBackend::new(SandboxConfig {
            program: "ai-relay-no-such-program".into(),
            args: vec![],
            label: "test".into(),
        });
        let err = backend.generate("x", None, &ctx()).await.unwrap_err();
        assert!(matches!(err, BackendError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn cancel_kills_running_process() {
        let backend = sh("sleep 30");
        let ctx = ctx();

        let call = backend.generate("x", None, &ctx);
        let cancel = async {
            while !ctx.has_kill_handle() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ctx.cancel(CancelReason::Owner);
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(call, cancel)
        })
        .await
        .expect("killed process did not return");
        assert_eq!(result.unwrap(), None);
    }

    #[test]
    fn truncate_output_short() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn truncate_output_long() {
        let s = "x".repeat(MAX_OUTPUT_SIZE + 1000);
        let result = truncate_output(&s);
        assert!(result.contains("[truncated 1000 bytes]"));
        assert!(result.len() < s.len());
    }
}
