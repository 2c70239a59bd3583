//! Test-only helpers: a scripted process runner and engine setup.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::engine::Engine;
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::invoker::{ProcessRequest, ProcessRunner};

/// Scripted behavior of one app, keyed by task label (the procedure name).
#[derive(Debug, Clone)]
pub enum Script {
    /// Write every expected output and succeed.
    Succeed,
    /// Exit "nonzero" with this reason.
    Fail(String),
    /// Succeed without creating the expected outputs.
    SkipOutputs,
    /// Run for this long (honoring cancellation and timeouts), then succeed.
    Sleep(Duration),
}

/// Fake [`ProcessRunner`] that records requests and follows scripts.
///
/// Output files contain the request's command line, so consumers can check
/// what produced them.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, Script>>,
    requests: Mutex<Vec<ProcessRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, task: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(task.to_string(), script);
        self
    }

    /// Requests in the order they were started.
    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn requests_for(&self, task: &str) -> Vec<ProcessRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.task == task)
            .collect()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run(
        &self,
        request: &ProcessRequest,
        is_cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get(&request.task)
            .cloned()
            .unwrap_or(Script::Succeed);

        match script {
            Script::Succeed => write_outputs(request),
            Script::Fail(reason) => Err(EngineError::ProcessFailure {
                task: request.task.clone(),
                reason,
            }),
            Script::SkipOutputs => Ok(()),
            Script::Sleep(duration) => {
                let started = Instant::now();
                while started.elapsed() < duration {
                    if is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    if let Some(timeout) = request.timeout
                        && started.elapsed() >= timeout
                    {
                        return Err(EngineError::TimedOut {
                            task: request.task.clone(),
                            after: timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                write_outputs(request)
            }
        }
    }
}

fn write_outputs(request: &ProcessRequest) -> Result<(), EngineError> {
    let line = request.command_line();
    for path in request.expected_outputs.iter().chain(request.stdout.iter()) {
        fs::write(path, format!("{line}\n"))
            .map_err(|err| EngineError::io(format!("write {}", path.display()), &err))?;
    }
    Ok(())
}

/// Config rooted at `work_dir` with a small worker pool.
pub fn test_config(work_dir: &Path) -> EngineConfig {
    EngineConfig {
        parallelism: 4,
        work_dir: work_dir.to_path_buf(),
        poll_interval_ms: 10,
        ..EngineConfig::default()
    }
}

/// Engine over a scripted runner that swallows trace output.
pub fn scripted_engine(config: EngineConfig, runner: Arc<ScriptedRunner>) -> Engine {
    Engine::new(config)
        .with_runner(runner)
        .with_trace_sink(Arc::new(|_: &str| {}))
}
