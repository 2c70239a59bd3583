//! External process invocation behind the [`ProcessRunner`] seam.
//!
//! The engine builds a fully resolved [`ProcessRequest`] and hands it to a
//! runner. [`SystemRunner`] spawns real processes; tests script the runner
//! instead (see `test_support`).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::EngineError;
use crate::io::process::{CommandLimits, Termination, run_command};

/// Fully resolved invocation of an app procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    /// Task label, used in diagnostics.
    pub task: String,
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    /// Files the process must have created when it exits successfully.
    pub expected_outputs: Vec<PathBuf>,
    pub timeout: Option<Duration>,
    pub work_dir: PathBuf,
}

impl ProcessRequest {
    /// Command line as it would be typed in a shell, for logs and reports.
    pub fn command_line(&self) -> String {
        let mut line = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(stdin) = &self.stdin {
            line.push_str(&format!(" < {}", stdin.display()));
        }
        if let Some(stdout) = &self.stdout {
            line.push_str(&format!(" > {}", stdout.display()));
        }
        line
    }
}

pub trait ProcessRunner: Send + Sync {
    /// Run the request to completion.
    ///
    /// Returns `ProcessFailure` on a nonzero exit or a failed launch,
    /// `TimedOut` when the request's timeout elapses and `Cancelled` when
    /// `is_cancelled` turns true while the process runs.
    fn run(
        &self,
        request: &ProcessRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError>;
}

/// Runs requests as real child processes.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    pub output_limit_bytes: usize,
    pub poll_interval: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self {
            output_limit_bytes: 64_000,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ProcessRunner for SystemRunner {
    #[instrument(skip_all, fields(task = %request.task, program = %request.program))]
    fn run(
        &self,
        request: &ProcessRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).current_dir(&request.work_dir);
        debug!(command = %request.command_line(), "invoking");

        let limits = CommandLimits {
            timeout: request.timeout,
            output_limit_bytes: self.output_limit_bytes,
            poll_interval: self.poll_interval,
        };
        let output = run_command(
            cmd,
            request.stdin.as_deref(),
            request.stdout.as_deref(),
            limits,
            is_cancelled,
        )
        .map_err(|err| EngineError::ProcessFailure {
            task: request.task.clone(),
            reason: format!("{err:#}"),
        })?;

        // Unbound stdout is captured, never written anywhere else.
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(stdout = %stdout.trim_end(), truncated = output.stdout_truncated, "app stdout");
        }

        match output.termination {
            Termination::Exited(status) if status.success() => Ok(()),
            Termination::Exited(status) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let mut reason = match status.code() {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                };
                // Tools that report errors on stdout still get a diagnosis.
                let diagnostics = if stderr.trim().is_empty() { &stdout } else { &stderr };
                if !diagnostics.trim().is_empty() {
                    reason.push_str(": ");
                    reason.push_str(diagnostics.trim());
                }
                reason.push_str(&output.stderr_truncated_notice(&request.program));
                Err(EngineError::ProcessFailure {
                    task: request.task.clone(),
                    reason: reason.trim_end().to_string(),
                })
            }
            Termination::TimedOut => Err(EngineError::TimedOut {
                task: request.task.clone(),
                after: request.timeout.unwrap_or_default(),
            }),
            Termination::Cancelled => Err(EngineError::Cancelled),
        }
    }
}

/// Fail with `ProcessFailure` unless every expected output exists.
pub fn verify_outputs(request: &ProcessRequest) -> Result<(), EngineError> {
    match request.expected_outputs.iter().find(|path| !path.exists()) {
        Some(missing) => Err(EngineError::ProcessFailure {
            task: request.task.clone(),
            reason: format!("expected output {} was not created", missing.display()),
        }),
        None => Ok(()),
    }
}

/// Materialize a string as a file, byte for byte.
pub fn write_data(path: &Path, text: &str) -> Result<(), EngineError> {
    fs::write(path, text.as_bytes())
        .map_err(|err| EngineError::io(format!("write {}", path.display()), &err))
}

/// Read a file back as a string.
pub fn read_data(path: &Path) -> Result<String, EngineError> {
    let bytes =
        fs::read(path).map_err(|err| EngineError::io(format!("read {}", path.display()), &err))?;
    String::from_utf8(bytes)
        .map_err(|_| EngineError::Io(format!("{} is not valid UTF-8", path.display())))
}

pub fn copy_file(from: &Path, to: &Path) -> Result<(), EngineError> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|err| EngineError::io(format!("copy {} to {}", from.display(), to.display()), &err))
}
