//! Subprocess invocation for the external repository tools.
//!
//! Every indexer run goes through [`run`]: the child's stdout is logged at
//! info and its stderr at warn, line by line, while stderr is also captured
//! as the result message. A process that cannot be started is an `error`
//! result (the tool is unusable); a nonzero exit is a `script` result (the
//! tool ran but reported failure).

use std::ffi::{OsStr, OsString};
use std::process::Stdio;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// Classification of one tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    /// The process ran and exited zero.
    Success,
    /// The process ran but exited nonzero (or died to a signal).
    Script,
    /// The process could not be started.
    Error,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Invocation classification.
    pub status: ExecStatus,
    /// Exit code, when the process ran and reported one.
    pub exit_code: Option<i32>,
    /// Captured standard error (the failure message for `script` results,
    /// the spawn error text for `error` results).
    pub stderr: String,
    /// Captured standard output.
    pub stdout: String,
}

impl ExecResult {
    /// True for a clean, zero-exit run.
    pub fn ok(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

/// Run an external tool to completion.
///
/// There is deliberately no timeout: indexer invocations run until they
/// exit.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> ExecResult
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program: OsString = program.as_ref().to_os_string();
    let args: Vec<OsString> = args
        .into_iter()
        .map(|arg| arg.as_ref().to_os_string())
        .collect();

    let tool = program.to_string_lossy().into_owned();
    let display: Vec<String> = std::iter::once(&program)
        .chain(args.iter())
        .map(|part| part.to_string_lossy().into_owned())
        .collect();
    let command_line = shlex::try_join(display.iter().map(String::as_str))
        .unwrap_or_else(|_| display.join(" "));
    info!("[{tool}] executing: {command_line}");

    let mut child = match Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!("[{tool}] failed to run executable: {err}");
            return ExecResult {
                status: ExecStatus::Error,
                exit_code: None,
                stderr: err.to_string(),
                stdout: String::new(),
            };
        }
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_tool = tool.clone();
    let stderr_tool = tool.clone();
    let (status, stdout, stderr) = tokio::join!(
        child.wait(),
        capture_lines(stdout_pipe, move |line| info!(
            "[{stdout_tool} stdout]: {line}"
        )),
        capture_lines(stderr_pipe, move |line| warn!(
            "[{stderr_tool} stderr]: {line}"
        )),
    );

    match status {
        Ok(status) if status.success() => ExecResult {
            status: ExecStatus::Success,
            exit_code: status.code(),
            stderr,
            stdout,
        },
        Ok(status) => {
            warn!(
                "[{tool}] execution finished with exit code: {}",
                status
                    .code()
                    .map_or_else(|| "none".to_string(), |code| code.to_string())
            );
            ExecResult {
                status: ExecStatus::Script,
                exit_code: status.code(),
                stderr,
                stdout,
            }
        }
        Err(err) => {
            warn!("[{tool}] failed to collect executable: {err}");
            ExecResult {
                status: ExecStatus::Error,
                exit_code: None,
                stderr: err.to_string(),
                stdout,
            }
        }
    }
}

async fn capture_lines<R>(pipe: Option<R>, log_line: impl Fn(&str)) -> String
where
    R: AsyncRead + Unpin,
{
    let mut captured = String::new();
    let Some(pipe) = pipe else {
        return captured;
    };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            log_line(&line);
        }
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}
