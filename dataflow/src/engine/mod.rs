//! Dataflow execution: graph construction, scheduling and the run facade.
//!
//! [`Engine::run`] analyzes a program, instantiates its main block into the
//! root scope and drains the resulting tasks on a fixed pool of worker
//! threads. The run ends when the root scope closes.

mod builder;
pub mod run;
pub mod scheduler;
pub mod scope;
pub mod store;
pub mod task;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, instrument, warn};

use crate::core::analysis::check_program;
use crate::core::program::{Expr, Program};
use crate::core::resource::parse_memory_mb;
use crate::core::value::{Value, VarType};
use crate::engine::run::{RunCore, RunSettings};
use crate::engine::scope::ScopeId;
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::io::invoker::{ProcessRunner, SystemRunner};
use crate::io::mapper::FileMapper;

pub use run::{CancelHandle, RunReport, TaskRecord, TaskStatus, TraceSink, VariableReport};
pub use store::VarState;

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub struct Engine {
    config: EngineConfig,
    runner: Arc<dyn ProcessRunner>,
    trace_sink: Arc<TraceSink>,
    cancel: CancelHandle,
}

impl Engine {
    /// Engine running real processes and printing traces to stdout.
    pub fn new(config: EngineConfig) -> Self {
        let runner = SystemRunner {
            output_limit_bytes: config.output_limit_bytes,
            poll_interval: config.poll_interval(),
        };
        Self {
            config,
            runner: Arc::new(runner),
            trace_sink: Arc::new(|line: &str| println!("{line}")),
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<TraceSink>) -> Self {
        self.trace_sink = sink;
        self
    }

    /// Handle for cancelling scopes of the run in progress.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Build-time validation only; nothing is scheduled.
    pub fn check(&self, program: &Program) -> Result<(), EngineError> {
        check_program(program)
    }

    /// Run `program` with the given top-level parameter values.
    ///
    /// Build-time errors (analysis, unknown or missing parameters) are
    /// returned as `Err`. Task failures are part of the returned report.
    #[instrument(skip_all, fields(params = params.len()))]
    pub fn run(
        &self,
        program: &Program,
        params: &BTreeMap<String, String>,
    ) -> Result<RunReport, EngineError> {
        check_program(program)?;
        let budget_mb = parse_memory_mb(&self.config.memory_budget)?;
        let work_dir = std::path::absolute(&self.config.work_dir)
            .map_err(|err| EngineError::io(format!("resolve {}", self.config.work_dir.display()), &err))?;
        let run_dir = work_dir.join(&self.config.state_dir).join(run_name());
        fs::create_dir_all(&run_dir)
            .map_err(|err| EngineError::io(format!("create {}", run_dir.display()), &err))?;
        info!(run_dir = %run_dir.display(), workers = self.config.parallelism, "starting run");

        let settings = RunSettings {
            fail_fast: self.config.fail_fast,
            task_timeout: self.config.task_timeout(),
            work_dir: work_dir.clone(),
        };
        let core = RunCore::new(
            program,
            self.runner.as_ref(),
            self.trace_sink.as_ref(),
            FileMapper::new(work_dir, run_dir),
            budget_mb,
            settings,
        );
        bind_params(&core, program, params)?;

        if let Err(err) = core.instantiate_block(&program.main, &core.root) {
            warn!(err = %err, "graph construction failed");
            core.record_failure(&err);
            core.cancel_run();
            core.release_scope(&core.root);
            return Err(err);
        }
        core.release_scope(&core.root);

        self.cancel.attach(&core.scheduler);
        std::thread::scope(|threads| {
            for _ in 0..self.config.parallelism.max(1) {
                threads.spawn(|| core.worker());
            }
        });
        self.cancel.detach();

        let report = core.report();
        info!(
            tasks = report.tasks.len(),
            succeeded = report.succeeded(),
            elapsed = ?report.elapsed,
            "run finished"
        );
        Ok(report)
    }
}

fn run_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!(
        "run-{secs}-{}-{}",
        std::process::id(),
        RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Declare every program parameter in the root scope and settle it from the
/// supplied value or its default.
fn bind_params(
    core: &RunCore<'_>,
    program: &Program,
    params: &BTreeMap<String, String>,
) -> Result<(), EngineError> {
    if let Some(unknown) = params
        .keys()
        .find(|name| !program.params.iter().any(|param| &param.name == *name))
    {
        return Err(EngineError::invalid(format!("unknown parameter `{unknown}`")));
    }
    for param in &program.params {
        let value = match (params.get(&param.name), &param.default) {
            (Some(raw), _) => Value::parse_as(&param.ty, raw)?,
            (None, Some(default)) => default_value(&param.ty, default)?,
            (None, None) => {
                return Err(EngineError::invalid(format!(
                    "parameter `{}` has no value and no default",
                    param.name
                )));
            }
        };
        let value = anchor_files(value, &core.settings.work_dir);
        let var = core.store.declare(param.name.clone(), param.ty.clone(), ScopeId(0));
        core.root.bind(&param.name, var);
        core.settle_now(var, value)?;
    }
    Ok(())
}

fn default_value(ty: &VarType, expr: &Expr) -> Result<Value, EngineError> {
    let value = match (ty, expr) {
        (VarType::File(_), Expr::Str(path)) => Value::File(PathBuf::from(path)),
        (VarType::Array(element), Expr::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| default_value(element, item))
                .collect::<Result<_, _>>()?,
        ),
        (_, Expr::Str(text)) => Value::Str(text.clone()),
        (_, Expr::Int(n)) => Value::Int(*n),
        (_, Expr::Bool(b)) => Value::Bool(*b),
        _ => return Err(EngineError::invalid("parameter defaults must be literals")),
    };
    if value.conforms_to(ty) {
        Ok(value)
    } else {
        Err(EngineError::mismatch("parameter default", ty, value.shape()))
    }
}

/// Relative file parameters are relative to the work directory.
fn anchor_files(value: Value, work_dir: &std::path::Path) -> Value {
    match value {
        Value::File(path) if path.is_relative() => Value::File(work_dir.join(path)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| anchor_files(item, work_dir))
                .collect(),
        ),
        other => other,
    }
}
