//! Run context and task execution.
//!
//! [`RunCore`] is the explicit context threaded through graph construction
//! and execution: the variable store, the scheduler, the file mapper and the
//! process runner of one run. Workers loop on [`Scheduler::next`] and execute
//! tasks to completion; they never block on an unresolved variable.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::core::expr::evaluate;
use crate::core::program::Program;
use crate::core::value::{Operand, Value, VarId, VarType};
use crate::engine::scheduler::{Next, Scheduler};
use crate::engine::scope::{Scope, ScopeId};
use crate::engine::store::{VarState, VarStore};
use crate::engine::task::{AppCall, Task, TaskId, TaskKind};
use crate::error::EngineError;
use crate::io::invoker::{
    ProcessRequest, ProcessRunner, copy_file, read_data, verify_outputs, write_data,
};
use crate::io::mapper::{FileMapper, MapRequest};

/// Receives each trace line as it is produced.
pub type TraceSink = dyn Fn(&str) + Send + Sync;

/// Cancels scopes of the run an [`crate::engine::Engine`] is executing.
///
/// Scopes are named by label: `main` for the root, `sample[2]` for the third
/// iteration of a top-level `foreach sample`, `sample[2]/call_de` for a call
/// inside it. Cancelling a scope cancels every task within it that has not
/// settled yet; settled variables keep their values.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    scheduler: Arc<Mutex<Option<Weak<Scheduler>>>>,
}

impl CancelHandle {
    pub(crate) fn attach(&self, scheduler: &Arc<Scheduler>) {
        *self.lock() = Some(Arc::downgrade(scheduler));
    }

    pub(crate) fn detach(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Weak<Scheduler>>> {
        self.scheduler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel every open scope labelled `label`. Returns false when no run
    /// is executing.
    pub fn cancel_scope(&self, label: &str) -> bool {
        let scheduler = self.lock().as_ref().and_then(Weak::upgrade);
        match scheduler {
            Some(scheduler) => {
                scheduler.request_cancel(label);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub fail_fast: bool,
    pub task_timeout: Option<Duration>,
    pub work_dir: PathBuf,
}

/// Mapping policy of a declared file variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingKind {
    Fixed,
    SinglePerRun,
    Concurrent,
}

/// Mapping whose parameters were not known when the graph was built.
#[derive(Debug, Clone)]
pub(crate) struct PendingPath {
    pub kind: MappingKind,
    pub operands: Vec<Operand>,
    pub owner: String,
    pub scope: ScopeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Succeeded,
    /// The task itself failed.
    Failed(EngineError),
    /// An input had failed; the task body never ran.
    UpstreamFailed(EngineError),
    Cancelled,
}

/// Outcome of one task, with times relative to the start of the run.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub label: String,
    pub scope: ScopeId,
    pub status: TaskStatus,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub started: Duration,
    pub finished: Duration,
    /// Command line of app tasks.
    pub command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VariableReport {
    pub id: VarId,
    pub name: String,
    pub scope: ScopeId,
    pub ty: VarType,
    pub state: VarState,
    pub settled: Option<Duration>,
    pub path: Option<PathBuf>,
}

/// Everything observable about a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub variables: Vec<VariableReport>,
    pub tasks: Vec<TaskRecord>,
    pub traces: Vec<String>,
    /// First task that failed by itself, if any.
    pub failure: Option<EngineError>,
    pub run_dir: PathBuf,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Root-scope variable by name.
    pub fn variable(&self, name: &str) -> Option<&VariableReport> {
        self.variables
            .iter()
            .find(|var| var.scope == ScopeId(0) && var.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        match &self.variable(name)?.state {
            VarState::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn var(&self, id: VarId) -> &VariableReport {
        &self.variables[id.0]
    }

    /// Tasks whose label starts with `prefix`, in submission order.
    pub fn tasks_labelled<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a TaskRecord> {
        self.tasks
            .iter()
            .filter(move |task| task.label.starts_with(prefix))
    }
}

pub(crate) struct RunCore<'r> {
    pub(crate) program: &'r Program,
    pub(crate) store: VarStore,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) mapper: FileMapper,
    pub(crate) settings: RunSettings,
    pub(crate) root: Arc<Scope>,
    runner: &'r dyn ProcessRunner,
    trace_sink: &'r TraceSink,
    next_scope: AtomicUsize,
    scopes: Mutex<Vec<Weak<Scope>>>,
    pub(crate) pending_paths: Mutex<HashMap<VarId, PendingPath>>,
    pub(crate) mapped: Mutex<HashSet<VarId>>,
    records: Mutex<Vec<TaskRecord>>,
    traces: Mutex<Vec<String>>,
    failure: Mutex<Option<EngineError>>,
    started: Instant,
}

impl<'r> RunCore<'r> {
    pub(crate) fn new(
        program: &'r Program,
        runner: &'r dyn ProcessRunner,
        trace_sink: &'r TraceSink,
        mapper: FileMapper,
        budget_mb: u64,
        settings: RunSettings,
    ) -> Self {
        let root = Scope::root();
        Self {
            program,
            store: VarStore::new(),
            scheduler: Arc::new(Scheduler::new(budget_mb)),
            mapper,
            settings,
            scopes: Mutex::new(vec![Arc::downgrade(&root)]),
            root,
            runner,
            trace_sink,
            next_scope: AtomicUsize::new(1),
            pending_paths: Mutex::new(HashMap::new()),
            mapped: Mutex::new(HashSet::new()),
            records: Mutex::new(Vec::new()),
            traces: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub(crate) fn open_scope(&self, parent: &Arc<Scope>, label: impl Into<String>) -> Arc<Scope> {
        let id = ScopeId(self.next_scope.fetch_add(1, Ordering::Relaxed));
        let scope = Scope::child(parent, id, label);
        self.scopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::downgrade(&scope));
        scope
    }

    /// Release one unit of work on `scope`, closing scopes that drain.
    pub(crate) fn release_scope(&self, scope: &Scope) {
        let closed = scope.release();
        for id in &closed {
            self.mapper.release_scope(*id);
            debug!(scope = %id, "scope closed");
        }
        if closed.contains(&ScopeId(0)) {
            self.scheduler.finish();
        }
    }

    /// Register a task with its scope and the scheduler, and subscribe it to
    /// its inputs.
    pub(crate) fn submit(&self, task: Task) -> TaskId {
        task.scope.acquire();
        let inputs = task.inputs.clone();
        let id = self.scheduler.submit(task);
        for input in inputs {
            let scheduler = Arc::clone(&self.scheduler);
            self.store.on_settle(
                input,
                Box::new(move |outcome| scheduler.input_settled(id, outcome.is_err())),
            );
        }
        id
    }

    pub(crate) fn emit_trace(&self, values: &[Value]) {
        let line = values
            .iter()
            .map(Value::render)
            .collect::<Vec<_>>()
            .join(", ");
        (self.trace_sink)(&line);
        self.traces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    pub(crate) fn worker(&self) {
        loop {
            match self.scheduler.next() {
                Next::Run(task) => {
                    let id = task.id;
                    self.execute(task);
                    self.scheduler.complete(id);
                }
                Next::Stalled(tasks) => {
                    for task in tasks {
                        let err = EngineError::dependency(format!(
                            "`{}` waits on inputs that can never settle",
                            task.label
                        ));
                        self.record_failure(&err);
                        self.abandon(task, TaskStatus::Failed(err));
                    }
                }
                Next::Cancel(label) => self.cancel_label(&label),
                Next::Finished => return,
            }
        }
    }

    /// Settle a task that will never run and give back its scope token.
    fn abandon(&self, task: Task, status: TaskStatus) {
        let err = match &status {
            TaskStatus::Failed(err) | TaskStatus::UpstreamFailed(err) => err.clone(),
            _ => EngineError::Cancelled,
        };
        let now = self.started.elapsed();
        self.fail_task(&task, &err);
        self.release_exports(&task);
        self.push_record(&task, status, now, None);
        self.release_scope(&task.scope);
    }

    fn fail_task(&self, task: &Task, err: &EngineError) {
        for output in &task.outputs {
            self.store.fail(*output, err.clone());
        }
        for scalar in &task.exports.scalars {
            self.store.fail(*scalar, err.clone());
        }
        for array in &task.exports.arrays {
            self.store.poison(*array, err.clone());
        }
    }

    fn release_exports(&self, task: &Task) {
        for array in &task.exports.arrays {
            self.store.release_writer(*array);
        }
    }

    fn push_record(
        &self,
        task: &Task,
        status: TaskStatus,
        started: Duration,
        command: Option<String>,
    ) {
        let record = TaskRecord {
            id: task.id,
            label: task.label.clone(),
            scope: task.scope.id(),
            status,
            inputs: task.inputs.clone(),
            outputs: task.outputs.clone(),
            started,
            finished: self.started.elapsed(),
            command,
        };
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub(crate) fn record_failure(&self, err: &EngineError) {
        let mut failure = self
            .failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failure.is_none() {
            *failure = Some(err.clone());
        }
    }

    /// Cancel the whole run and drop every queued task.
    pub(crate) fn cancel_run(&self) {
        self.cancel_scope(&self.root);
    }

    /// Cancel every open scope labelled `label`.
    fn cancel_label(&self, label: &str) {
        let matching: Vec<Arc<Scope>> = {
            let mut scopes = self
                .scopes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            scopes.retain(|scope| scope.strong_count() > 0);
            scopes
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|scope| scope.label() == label)
                .collect()
        };
        if matching.is_empty() {
            warn!(label, "no open scope to cancel");
        }
        for scope in matching {
            self.cancel_scope(&scope);
        }
    }

    /// Cancel `scope` and its descendants. Queued tasks within it are dropped
    /// at once; running ones observe the flag and stop.
    pub(crate) fn cancel_scope(&self, scope: &Scope) {
        scope.cancel();
        let id = scope.id();
        let removed = self.scheduler.cancel_where(|task| task.scope.is_within(id));
        if !removed.is_empty() {
            info!(scope = %id, label = scope.label(), count = removed.len(), "cancelled queued tasks");
        }
        for task in removed {
            let status = match self.failed_input(&task) {
                Some(EngineError::Cancelled) | None => TaskStatus::Cancelled,
                Some(err) => TaskStatus::UpstreamFailed(err),
            };
            self.abandon(task, status);
        }
    }

    fn failed_input(&self, task: &Task) -> Option<EngineError> {
        task.inputs.iter().find_map(|input| match self.store.state(*input) {
            VarState::Failed(err) => Some(err),
            _ => None,
        })
    }

    #[instrument(skip_all, fields(task = %task.id, label = %task.label))]
    fn execute(&self, task: Task) {
        let started = self.started.elapsed();

        if task.scope.is_cancelled() {
            self.abandon(task, TaskStatus::Cancelled);
            return;
        }
        if let Some(err) = self.failed_input(&task) {
            debug!(err = %err, "input failed; skipping");
            self.abandon(task, TaskStatus::UpstreamFailed(err));
            return;
        }

        let mut command = None;
        let result = self
            .run_body(&task, &mut command)
            .and_then(|values| self.settle_outputs(&task, values));

        let status = match result {
            Ok(()) => TaskStatus::Succeeded,
            Err(EngineError::Cancelled) => {
                self.fail_task(&task, &EngineError::Cancelled);
                TaskStatus::Cancelled
            }
            Err(err) => {
                warn!(err = %err, kind = err.kind(), "task failed");
                self.fail_task(&task, &err);
                self.record_failure(&err);
                if self.settings.fail_fast {
                    self.cancel_run();
                }
                TaskStatus::Failed(err)
            }
        };
        self.release_exports(&task);
        self.push_record(&task, status, started, command);
        self.release_scope(&task.scope);
    }

    /// Run the task body and return one value per output.
    fn run_body(&self, task: &Task, command: &mut Option<String>) -> Result<Vec<Value>, EngineError> {
        match &task.kind {
            TaskKind::Eval { op, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.resolve(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(vec![evaluate(*op, &values)?])
            }
            TaskKind::App(call) => self.run_app(task, call, command),
            TaskKind::WriteData { text } => {
                let text = self.resolve(text)?.render();
                let path = self.output_path(task)?;
                write_data(&path, &text)?;
                Ok(vec![Value::File(path)])
            }
            TaskKind::ReadData { file } => {
                let path = file_path(&self.resolve(file)?)?;
                Ok(vec![Value::Str(read_data(&path)?)])
            }
            TaskKind::Copy { source } => {
                let source = file_path(&self.resolve(source)?)?;
                let path = self.output_path(task)?;
                copy_file(&source, &path)?;
                Ok(vec![Value::File(path)])
            }
            TaskKind::Trace { args } => {
                let values = args
                    .iter()
                    .map(|arg| self.resolve(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.emit_trace(&values);
                Ok(Vec::new())
            }
            TaskKind::Foreach {
                var,
                index,
                element,
                over,
                body,
            } => match self.resolve(over)? {
                Value::Array(items) => {
                    debug!(iterations = items.len(), "unrolling deferred foreach");
                    self.unroll(var, index.as_deref(), element, &items, body, &task.scope)?;
                    Ok(Vec::new())
                }
                other => Err(EngineError::mismatch("foreach", "array", other.shape())),
            },
            TaskKind::Guard {
                cond,
                then,
                otherwise,
            } => match self.resolve(cond)? {
                Value::Bool(taken) => {
                    debug!(taken, "guard resolved");
                    let branch = if taken { then } else { otherwise };
                    self.instantiate_branch(branch, if taken { "then" } else { "else" }, &task.scope)?;
                    Ok(Vec::new())
                }
                other => Err(EngineError::mismatch("if condition", "boolean", other.shape())),
            },
        }
    }

    fn run_app(
        &self,
        task: &Task,
        call: &AppCall,
        command: &mut Option<String>,
    ) -> Result<Vec<Value>, EngineError> {
        let mut args = Vec::with_capacity(call.argv.len());
        for token in &call.argv {
            match self.resolve(token)? {
                Value::Array(items) => args.extend(items.iter().map(Value::render)),
                value => args.push(value.render()),
            }
        }
        let stdin = match &call.stdin {
            Some(operand) => Some(file_path(&self.resolve(operand)?)?),
            None => None,
        };
        let mut outputs = Vec::with_capacity(task.outputs.len());
        for output in &task.outputs {
            let path = self.path_of(*output)?;
            self.mapper.prepare_output(&path)?;
            outputs.push(path);
        }
        let stdout = match call.stdout {
            Some(var) => Some(self.path_of(var)?),
            None => None,
        };

        let request = ProcessRequest {
            task: task.label.clone(),
            program: call.executable.clone(),
            args,
            stdin,
            stdout,
            expected_outputs: outputs.clone(),
            timeout: call.timeout,
            work_dir: self.settings.work_dir.clone(),
        };
        *command = Some(request.command_line());
        info!(command = %request.command_line(), "running app");
        let scope = Arc::clone(&task.scope);
        self.runner.run(&request, &|| scope.is_cancelled())?;
        verify_outputs(&request)?;
        Ok(outputs.into_iter().map(Value::File).collect())
    }

    fn output_path(&self, task: &Task) -> Result<PathBuf, EngineError> {
        let output = task
            .outputs
            .first()
            .ok_or_else(|| EngineError::invalid(format!("`{}` has no output", task.label)))?;
        let path = self.path_of(*output)?;
        self.mapper.prepare_output(&path)?;
        Ok(path)
    }

    fn settle_outputs(&self, task: &Task, values: Vec<Value>) -> Result<(), EngineError> {
        for (output, value) in task.outputs.iter().zip(values) {
            if let Value::File(path) = &value {
                self.store.set_path(*output, path.clone());
            }
            self.store.set(*output, value)?;
        }
        Ok(())
    }

    /// Value of an operand whose inputs have settled.
    pub(crate) fn resolve(&self, operand: &Operand) -> Result<Value, EngineError> {
        match operand {
            Operand::Lit(value) => Ok(value.clone()),
            Operand::Var(var) => match self.store.state(*var) {
                VarState::Resolved(value) => Ok(value),
                VarState::Failed(err) => Err(err),
                VarState::Unresolved => Err(EngineError::dependency(format!(
                    "`{}` read before it settled",
                    self.store.var(*var).name()
                ))),
            },
            Operand::PathOf(var) => Ok(Value::Str(self.path_of(*var)?.display().to_string())),
        }
    }

    /// Backing path of a file variable, computing a deferred mapping on
    /// first use.
    pub(crate) fn path_of(&self, var: VarId) -> Result<PathBuf, EngineError> {
        if let Some(path) = self.store.path(var) {
            return Ok(path);
        }
        let spec = self
            .pending_paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&var)
            .cloned()
            .ok_or_else(|| {
                EngineError::dependency(format!(
                    "`{}` has no backing path",
                    self.store.var(var).name()
                ))
            })?;
        // Operands may themselves name paths; resolve them unlocked.
        let values = spec
            .operands
            .iter()
            .map(|operand| self.resolve(operand).map(|value| value.render()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = self
            .pending_paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(path) = self.store.path(var) {
            return Ok(path);
        }
        let path = self.assign_path(var, spec.kind, &values, &spec.owner, spec.scope)?;
        pending.remove(&var);
        Ok(path)
    }

    pub(crate) fn assign_path(
        &self,
        var: VarId,
        kind: MappingKind,
        values: &[String],
        owner: &str,
        scope: ScopeId,
    ) -> Result<PathBuf, EngineError> {
        let first = values.first().cloned().unwrap_or_default();
        let request = match kind {
            MappingKind::Fixed => MapRequest::Fixed { name: first },
            MappingKind::SinglePerRun => MapRequest::SinglePerRun { name: first },
            MappingKind::Concurrent => MapRequest::Concurrent {
                prefix: first,
                suffix: values.get(1).cloned().unwrap_or_default(),
            },
        };
        let path = self.mapper.assign(&request, owner, scope)?;
        self.store.set_path(var, path.clone());
        Ok(path)
    }

    /// Variables a deferred mapping of `var` still waits on.
    pub(crate) fn path_deps(&self, var: VarId) -> Vec<VarId> {
        let pending = self
            .pending_paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending
            .get(&var)
            .map(|spec| {
                spec.operands
                    .iter()
                    .filter_map(|operand| match operand {
                        Operand::Var(dep) => Some(*dep),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn report(&self) -> RunReport {
        let variables = (0..self.store.len())
            .map(|index| {
                let var = self.store.var(VarId(index));
                VariableReport {
                    id: VarId(index),
                    name: var.name().to_string(),
                    scope: var.scope(),
                    ty: var.ty().clone(),
                    state: var.state(),
                    settled: var
                        .settled_at()
                        .map(|at| at.saturating_duration_since(self.started)),
                    path: self.store.path(VarId(index)),
                }
            })
            .collect();
        let mut tasks = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        tasks.sort_by_key(|task| task.id);
        RunReport {
            variables,
            tasks,
            traces: self
                .traces
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            failure: self
                .failure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            run_dir: self.mapper.run_dir().to_path_buf(),
            elapsed: self.started.elapsed(),
        }
    }
}

fn file_path(value: &Value) -> Result<PathBuf, EngineError> {
    match value {
        Value::File(path) => Ok(path.clone()),
        Value::Str(raw) => Ok(PathBuf::from(raw)),
        other => Err(EngineError::mismatch("file operand", "file", other.shape())),
    }
}
