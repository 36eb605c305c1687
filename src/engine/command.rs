//! Running external engines with a deadline and a cancellation token.
//!
//! [`ToolCommand`] spawns the engine with piped output, then races three
//! futures: process exit, the wall-clock deadline, and the caller's
//! [`CancellationToken`]. If the deadline or the token wins, the child is
//! killed and reaped before the error is returned, so no engine process
//! outlives its job.
//!
//! Output capture is bounded: only the last `capture_limit` bytes of each
//! stream are kept. Engines are chatty, and the tail is where the actual
//! failure is reported.

use crate::error::{sanitize_diagnostic, ConvertError};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bytes kept from the end of stdout and stderr.
const DEFAULT_CAPTURE_LIMIT: usize = 16 * 1024;

/// How long to wait for the output readers after the process has exited.
/// A grandchild that inherited the pipes can keep them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Output captured from an engine run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Tail of standard output (lossy UTF-8).
    pub stdout: String,
    /// Tail of standard error (lossy UTF-8).
    pub stderr: String,
}

/// Why an engine run did not succeed.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} could not be started: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool} was cancelled")]
    Cancelled { tool: String },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("I/O error waiting for {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

impl ToolError {
    /// Convert to the pipeline taxonomy. Diagnostics are sanitized against
    /// `scratch_root` and cut to `max_bytes`.
    pub fn into_convert_error(self, scratch_root: &Path, max_bytes: usize) -> ConvertError {
        match self {
            ToolError::Spawn { tool, source } if source.kind() == io::ErrorKind::NotFound => {
                ConvertError::EngineFailure {
                    engine: tool,
                    detail: "engine not installed".into(),
                }
            }
            ToolError::Spawn { tool, source } => ConvertError::EngineFailure {
                engine: tool,
                detail: sanitize_diagnostic(&source.to_string(), Some(scratch_root), max_bytes),
            },
            ToolError::Timeout { tool, timeout } => ConvertError::EngineTimeout {
                engine: tool,
                secs: timeout.as_secs(),
            },
            ToolError::Cancelled { .. } => ConvertError::Cancelled,
            ToolError::Failed { tool, status, stderr } => {
                let detail = if stderr.trim().is_empty() {
                    format!("exited with {status}")
                } else {
                    sanitize_diagnostic(&stderr, Some(scratch_root), max_bytes)
                };
                ConvertError::EngineFailure { engine: tool, detail }
            }
            ToolError::Io { tool, source } => ConvertError::EngineFailure {
                engine: tool,
                detail: sanitize_diagnostic(&source.to_string(), Some(scratch_root), max_bytes),
            },
        }
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// A builder for one engine invocation.
///
/// # Example
///
/// ```no_run
/// use edgequake_fileconv::engine::command::ToolCommand;
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cancel = CancellationToken::new();
/// let output = ToolCommand::new("ffmpeg")
///     .arg("-hide_banner")
///     .arg("-version")
///     .timeout(Duration::from_secs(5))
///     .execute(&cancel)
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
    capture_limit: usize,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout: DEFAULT_TIMEOUT,
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }

    pub fn arg(&mut self, s: impl Into<OsString>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<OsString>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn capture_limit(&mut self, bytes: usize) -> &mut Self {
        self.capture_limit = bytes;
        self
    }

    /// Short name used in logs and errors (`soffice`, `ffmpeg`, …).
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run to completion, the deadline, or cancellation, whichever comes first.
    ///
    /// # Errors
    ///
    /// - [`ToolError::Spawn`] if the program cannot be started.
    /// - [`ToolError::Timeout`] / [`ToolError::Cancelled`] after the child
    ///   has been killed and reaped.
    /// - [`ToolError::Failed`] on a non-zero exit, with the stderr tail.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
        let tool = self.tool_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: tool.clone(),
            source,
        })?;
        debug!(tool = %tool, pid = ?child.id(), timeout = ?self.timeout, "Engine spawned");

        let stdout = child
            .stdout
            .take()
            .map(|r| tokio::spawn(read_tail(r, self.capture_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|r| tokio::spawn(read_tail(r, self.capture_limit)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(Ok(status)) => status,
            Outcome::Exited(Err(source)) => {
                abort(stdout);
                abort(stderr);
                return Err(ToolError::Io { tool, source });
            }
            Outcome::TimedOut => {
                kill(&mut child, &tool).await;
                abort(stdout);
                abort(stderr);
                warn!(tool = %tool, timeout = ?self.timeout, "Engine timed out; killed");
                return Err(ToolError::Timeout {
                    tool,
                    timeout: self.timeout,
                });
            }
            Outcome::Cancelled => {
                kill(&mut child, &tool).await;
                abort(stdout);
                abort(stderr);
                debug!(tool = %tool, "Engine cancelled; killed");
                return Err(ToolError::Cancelled { tool });
            }
        };

        let output = ToolOutput {
            status,
            stdout: collect(stdout).await,
            stderr: collect(stderr).await,
        };

        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                status,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// `kill` sends SIGKILL and waits, which also reaps the child.
async fn kill(child: &mut tokio::process::Child, tool: &str) {
    if let Err(e) = child.kill().await {
        warn!(tool = %tool, error = %e, "Failed to kill engine");
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > cap {
                    let excess = tail.len() - cap;
                    tail.drain(..excess);
                }
            }
        }
    }
    tail
}

async fn collect(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}

fn abort(task: Option<JoinHandle<Vec<u8>>>) {
    if let Some(t) = task {
        t.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn execute_echo() {
        let output = ToolCommand::new("echo")
            .arg("hello")
            .execute(&CancellationToken::new())
            .await;

        match output {
            Ok(out) => {
                assert!(out.status.success());
                assert!(out.stdout.trim().contains("hello"));
            }
            Err(_) => {
                // On some minimal environments echo may not exist; skip.
            }
        }
    }

    #[tokio::test]
    async fn nonexistent_tool_is_not_installed() {
        let err = ToolCommand::new("nonexistent_tool_xyz_12345")
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
        match err.into_convert_error(Path::new("/tmp"), 512) {
            ConvertError::EngineFailure { detail, .. } => assert_eq!(detail, "engine not installed"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let started = Instant::now();
        let err = ToolCommand::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }), "unexpected: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err.into_convert_error(Path::new("/tmp"), 512),
            ConvertError::EngineTimeout { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = ToolCommand::new("sleep")
            .arg("10")
            .execute(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled { .. }), "unexpected: {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err.into_convert_error(Path::new("/tmp"), 512),
            ConvertError::Cancelled
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo 'cannot open /tmp/fileconv-x/in.docx' >&2; exit 3")
            .execute(&CancellationToken::new())
            .await
            .unwrap_err();
        match &err {
            ToolError::Failed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert!(stderr.contains("cannot open"));
            }
            other => panic!("unexpected: {other}"),
        }
        match err.into_convert_error(Path::new("/tmp/fileconv-x"), 512) {
            ConvertError::EngineFailure { engine, detail } => {
                assert_eq!(engine, "sh");
                assert_eq!(detail, "cannot open <scratch>/in.docx");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_keeps_only_the_tail() {
        let out = ToolCommand::new("sh")
            .arg("-c")
            .arg("i=0; while [ $i -lt 500 ]; do echo line$i; i=$((i+1)); done")
            .capture_limit(64)
            .execute(&CancellationToken::new())
            .await
            .unwrap();
        assert!(out.stdout.len() <= 64);
        assert!(out.stdout.trim_end().ends_with("line499"));
    }
}
