//! Helpers for running child processes with timeouts, cancellation and
//! bounded output.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub termination: Termination,
    /// Empty when stdout was redirected to a file.
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited(status) if status.success())
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandLimits {
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
    /// How often the cancellation check runs while the child is alive.
    pub poll_interval: Duration,
}

/// Run a command to completion, timeout or cancellation.
///
/// `stdin` and `stdout` bind the child's streams to files; otherwise stdin is
/// null and stdout is captured like stderr. Captured output is read
/// concurrently while the child runs and bounded by `output_limit_bytes`
/// (bytes beyond the limit are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = limits.timeout.map(|t| t.as_secs()), output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&Path>,
    stdout: Option<&Path>,
    limits: CommandLimits,
    is_cancelled: &dyn Fn() -> bool,
) -> Result<CommandOutput> {
    match stdin {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("open stdin {}", path.display()))?;
            cmd.stdin(Stdio::from(file));
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }
    match stdout {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("create stdout {}", path.display()))?;
            cmd.stdout(Stdio::from(file));
        }
        None => {
            cmd.stdout(Stdio::piped());
        }
    }
    cmd.stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let limit = limits.output_limit_bytes;
    let stdout_handle = child
        .stdout
        .take()
        .map(|out| thread::spawn(move || read_stream_limited(out, limit)));
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let started = Instant::now();
    let termination = loop {
        if let Some(status) = child
            .wait_timeout(limits.poll_interval)
            .context("wait for command")?
        {
            break Termination::Exited(status);
        }
        let stop = if is_cancelled() {
            Some(Termination::Cancelled)
        } else if limits.timeout.is_some_and(|t| started.elapsed() >= t) {
            Some(Termination::TimedOut)
        } else {
            None
        };
        if let Some(stop) = stop {
            warn!(?stop, "stopping command, killing");
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?;
            break stop;
        }
    };

    let (stdout, stdout_truncated) = match stdout_handle {
        Some(handle) => join_output(handle).context("join stdout")?,
        None => (Vec::new(), 0),
    };
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(?termination, "command finished");
    Ok(CommandOutput {
        termination,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
