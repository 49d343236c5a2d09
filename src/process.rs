//! External helper-tool invocation
//!
//! Helper tools (ps3dec, the FAT32 splitter) are opaque executables. The
//! runner spawns them with piped output, streams merged stdout/stderr lines
//! to an observer, and on cancellation asks the child to terminate before
//! force-killing it after a grace period.

use crate::error::{Error, ProcessError, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Callback receiving one line of merged tool output at a time
pub type OutputFn = Arc<dyn Fn(String) + Send + Sync>;

/// How a tool invocation ended when it did not error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The tool exited zero
    Completed,
    /// Cancellation terminated the tool before it finished
    Cancelled,
}

/// Resolve a helper tool to a concrete executable path
///
/// An explicitly configured path must point at an existing executable;
/// anything else is a setup error naming the offending config key. With no
/// explicit path and `search_path` enabled, the tool is looked up on PATH.
pub fn resolve_tool(
    configured: Option<&Path>,
    name: &str,
    search_path: bool,
    key: &str,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        let meta = std::fs::metadata(path).map_err(|e| Error::Config {
            message: format!("configured tool '{}' is not usable: {e}", path.display()),
            key: Some(key.to_string()),
        })?;
        if !meta.is_file() || !is_executable(&meta) {
            return Err(Error::Config {
                message: format!("configured tool '{}' is not an executable file", path.display()),
                key: Some(key.to_string()),
            });
        }
        return Ok(path.to_path_buf());
    }

    if search_path {
        return which::which(name).map_err(|e| Error::Config {
            message: format!("tool '{name}' not found on PATH: {e}"),
            key: Some(key.to_string()),
        });
    }

    Err(Error::Config {
        message: format!("tool '{name}' is not configured and PATH search is disabled"),
        key: Some(key.to_string()),
    })
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Runs helper tools with output streaming and cooperative termination
pub struct ToolRunner {
    termination_grace: Duration,
}

impl ToolRunner {
    /// Create a runner with the configured termination grace period
    pub fn new(termination_grace: Duration) -> Self {
        Self { termination_grace }
    }

    /// Run a tool to completion
    ///
    /// Stdout and stderr lines are forwarded to `output` as they arrive.
    /// A zero exit yields [`RunOutcome::Completed`]; any other exit is a
    /// [`ProcessError::NonZeroExit`] whose code is the negated signal
    /// number when the tool died to a signal on unix. Cancellation sends
    /// the tool a termination request, escalates to a kill after the
    /// grace period, and yields [`RunOutcome::Cancelled`].
    pub async fn run(
        &self,
        tool: &Path,
        args: &[&OsStr],
        cancel: &CancellationToken,
        output: Option<OutputFn>,
    ) -> std::result::Result<RunOutcome, ProcessError> {
        let mut child = Command::new(tool)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                tool: tool.to_path_buf(),
                source: e,
            })?;

        tracing::debug!(tool = %tool.display(), pid = child.id(), "spawned helper tool");

        // Pipes are always present with Stdio::piped
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.terminate(&mut child, tool).await?;
                    return Ok(RunOutcome::Cancelled);
                }
                line = next_line(&mut stdout), if stdout.is_some() => {
                    match line {
                        Some(line) => forward(&output, tool, line),
                        None => stdout = None,
                    }
                }
                line = next_line(&mut stderr), if stderr.is_some() => {
                    match line {
                        Some(line) => forward(&output, tool, line),
                        None => stderr = None,
                    }
                }
                else => break,
            }
        }

        let status = child.wait().await.map_err(|e| ProcessError::Reap {
            tool: tool.to_path_buf(),
            source: e,
        })?;

        if status.success() {
            Ok(RunOutcome::Completed)
        } else {
            Err(ProcessError::NonZeroExit {
                tool: tool.to_path_buf(),
                code: exit_code(&status),
            })
        }
    }

    /// Ask the child to stop, then force the issue after the grace period
    async fn terminate(
        &self,
        child: &mut Child,
        tool: &Path,
    ) -> std::result::Result<(), ProcessError> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid comes from a child we own and have not reaped yet
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tracing::debug!(tool = %tool.display(), pid, "sent SIGTERM to helper tool");
        }

        let graceful = tokio::time::timeout(self.termination_grace, child.wait()).await;
        match graceful {
            Ok(result) => {
                result.map_err(|e| ProcessError::Reap {
                    tool: tool.to_path_buf(),
                    source: e,
                })?;
            }
            Err(_) => {
                tracing::warn!(
                    tool = %tool.display(),
                    grace_secs = self.termination_grace.as_secs(),
                    "helper tool ignored termination request, killing"
                );
                child.kill().await.map_err(|e| ProcessError::Reap {
                    tool: tool.to_path_buf(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

async fn next_line<R>(
    lines: &mut Option<tokio::io::Lines<BufReader<R>>>,
) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match lines {
        Some(reader) => reader.next_line().await.ok().flatten(),
        None => None,
    }
}

fn forward(output: &Option<OutputFn>, tool: &Path, line: String) {
    tracing::trace!(tool = %tool.display(), line = %line, "tool output");
    if let Some(sink) = output {
        sink(line);
    }
}

/// Map an exit status to a single code, folding unix signal deaths into
/// negative numbers
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}
