//! Single-assignment variables.
//!
//! Each variable is a tri-state future guarded by its own mutex and condvar.
//! Settlement drains the registered hooks under the lock and runs them after
//! the lock is released, so a hook may freely read or settle other variables.
//!
//! Arrays can also be built element by element: [`VarStore::element`] hands
//! out one variable per index, and the array settles once no writer token is
//! outstanding and every element has settled.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::core::value::{Value, VarId, VarType};
use crate::engine::scope::ScopeId;
use crate::error::EngineError;

pub type Outcome = Result<Value, EngineError>;

/// Callback run exactly once when a variable settles.
pub type SettleHook = Box<dyn FnOnce(&Outcome) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum VarState {
    Unresolved,
    Resolved(Value),
    Failed(EngineError),
}

impl VarState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, VarState::Unresolved)
    }

    fn outcome(&self) -> Option<Outcome> {
        match self {
            VarState::Unresolved => None,
            VarState::Resolved(value) => Some(Ok(value.clone())),
            VarState::Failed(err) => Some(Err(err.clone())),
        }
    }
}

struct Slot {
    state: VarState,
    hooks: Vec<SettleHook>,
    settled_at: Option<Instant>,
}

#[derive(Default)]
struct ArrayBuild {
    writers: usize,
    pending: usize,
    sealed: bool,
    elements: BTreeMap<i64, (VarId, Arc<Variable>)>,
}

pub struct Variable {
    id: VarId,
    name: String,
    ty: VarType,
    scope: ScopeId,
    slot: Mutex<Slot>,
    settled: Condvar,
    path: Mutex<Option<PathBuf>>,
    build: Mutex<ArrayBuild>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Variable {
    fn new(id: VarId, name: String, ty: VarType, scope: ScopeId) -> Self {
        Self {
            id,
            name,
            ty,
            scope,
            slot: Mutex::new(Slot {
                state: VarState::Unresolved,
                hooks: Vec::new(),
                settled_at: None,
            }),
            settled: Condvar::new(),
            path: Mutex::new(None),
            build: Mutex::new(ArrayBuild::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &VarType {
        &self.ty
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn state(&self) -> VarState {
        lock(&self.slot).state.clone()
    }

    pub fn settled_at(&self) -> Option<Instant> {
        lock(&self.slot).settled_at
    }

    fn settle(&self, outcome: Outcome) -> Result<(), EngineError> {
        let mut slot = lock(&self.slot);
        if slot.state.is_settled() {
            return Err(EngineError::DoubleAssignment {
                variable: self.name.clone(),
            });
        }
        if let Ok(value) = &outcome
            && !value.conforms_to(&self.ty)
        {
            return Err(EngineError::mismatch(&self.name, &self.ty, value.shape()));
        }
        slot.state = match &outcome {
            Ok(value) => VarState::Resolved(value.clone()),
            Err(err) => VarState::Failed(err.clone()),
        };
        slot.settled_at = Some(Instant::now());
        let hooks = std::mem::take(&mut slot.hooks);
        drop(slot);
        self.settled.notify_all();

        trace!(var = %self.id, name = %self.name, ok = outcome.is_ok(), "settled");
        for hook in hooks {
            hook(&outcome);
        }
        Ok(())
    }

    fn get(&self) -> Outcome {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(outcome) = slot.state.outcome() {
                return outcome;
            }
            slot = self
                .settled
                .wait(slot)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn get_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot);
        loop {
            if let Some(outcome) = slot.state.outcome() {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .settled
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn on_settle(&self, hook: SettleHook) {
        let mut slot = lock(&self.slot);
        match slot.state.outcome() {
            Some(outcome) => {
                drop(slot);
                hook(&outcome);
            }
            None => slot.hooks.push(hook),
        }
    }

    fn element_settled(&self, outcome: &Outcome) {
        let mut build = lock(&self.build);
        build.pending = build.pending.saturating_sub(1);
        if let Err(err) = outcome {
            if !build.sealed {
                build.sealed = true;
                drop(build);
                let _ = self.settle(Err(err.clone()));
            }
            return;
        }
        self.complete_if_done(build);
    }

    /// Settle the array once nothing can add or change an element.
    fn complete_if_done(&self, mut build: MutexGuard<'_, ArrayBuild>) {
        if build.sealed || build.writers > 0 || build.pending > 0 {
            return;
        }
        build.sealed = true;
        let mut items = Vec::with_capacity(build.elements.len());
        let mut failure = None;
        for (_, element) in build.elements.values() {
            match element.state() {
                VarState::Resolved(value) => items.push(value),
                VarState::Failed(err) => {
                    failure = Some(err);
                    break;
                }
                VarState::Unresolved => {
                    failure = Some(EngineError::dependency(format!(
                        "element `{}` never settled",
                        element.name
                    )));
                    break;
                }
            }
        }
        drop(build);
        let outcome = match failure {
            Some(err) => Err(err),
            None => Ok(Value::Array(items)),
        };
        let _ = self.settle(outcome);
    }
}

/// Registry of every variable declared during a run.
#[derive(Default)]
pub struct VarStore {
    vars: RwLock<Vec<Arc<Variable>>>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, name: impl Into<String>, ty: VarType, scope: ScopeId) -> VarId {
        let mut vars = self
            .vars
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = VarId(vars.len());
        vars.push(Arc::new(Variable::new(id, name.into(), ty, scope)));
        id
    }

    /// Handle to a declared variable.
    ///
    /// Ids are only minted by [`VarStore::declare`], so every id is valid.
    pub fn var(&self, id: VarId) -> Arc<Variable> {
        let vars = self
            .vars
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&vars[id.0])
    }

    pub fn len(&self) -> usize {
        self.vars
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until the variable settles.
    pub fn get(&self, id: VarId) -> Outcome {
        self.var(id).get()
    }

    /// Like [`VarStore::get`], returning `None` if still unresolved after `timeout`.
    pub fn get_timeout(&self, id: VarId, timeout: Duration) -> Option<Outcome> {
        self.var(id).get_timeout(timeout)
    }

    pub fn state(&self, id: VarId) -> VarState {
        self.var(id).state()
    }

    /// Resolve a variable.
    ///
    /// Fails with `DoubleAssignment` if it already settled and with
    /// `TypeMismatch` if the value does not conform; in both cases the
    /// variable is left as it was.
    pub fn set(&self, id: VarId, value: Value) -> Result<(), EngineError> {
        self.var(id).settle(Ok(value))
    }

    /// Fail a variable. Returns false if it had already settled.
    pub fn fail(&self, id: VarId, err: EngineError) -> bool {
        self.var(id).settle(Err(err)).is_ok()
    }

    /// Run `hook` once the variable settles, or now if it already has.
    pub fn on_settle(&self, id: VarId, hook: SettleHook) {
        self.var(id).on_settle(hook);
    }

    pub fn set_path(&self, id: VarId, path: PathBuf) {
        *lock(&self.var(id).path) = Some(path);
    }

    pub fn path(&self, id: VarId) -> Option<PathBuf> {
        lock(&self.var(id).path).clone()
    }

    /// Element variable `array[index]`, declared on first use.
    pub fn element(&self, array: VarId, index: i64) -> Result<VarId, EngineError> {
        let array_var = self.var(array);
        let mut build = lock(&array_var.build);
        if let Some((id, _)) = build.elements.get(&index) {
            return Ok(*id);
        }
        let element_name = format!("{}[{index}]", array_var.name);
        if build.sealed || array_var.state().is_settled() {
            return Err(EngineError::DoubleAssignment {
                variable: element_name,
            });
        }
        let element_ty = array_var
            .ty
            .element()
            .cloned()
            .ok_or_else(|| EngineError::mismatch(&array_var.name, "array", &array_var.ty))?;
        let id = self.declare(element_name, element_ty, array_var.scope);
        let element = self.var(id);
        build.elements.insert(index, (id, Arc::clone(&element)));
        build.pending += 1;
        drop(build);

        let owner = Arc::clone(&array_var);
        element.on_settle(Box::new(move |outcome| owner.element_settled(outcome)));
        Ok(id)
    }

    /// Register constructs that may still assign elements of `array`.
    pub fn add_writers(&self, array: VarId, count: usize) {
        let var = self.var(array);
        lock(&var.build).writers += count;
    }

    /// Drop one writer token; the array settles when the last one goes and
    /// every element has settled.
    pub fn release_writer(&self, array: VarId) {
        let var = self.var(array);
        let mut build = lock(&var.build);
        build.writers = build.writers.saturating_sub(1);
        var.complete_if_done(build);
    }

    /// Fail an element-wise array whose writer can no longer finish.
    pub fn poison(&self, array: VarId, err: EngineError) {
        let var = self.var(array);
        let mut build = lock(&var.build);
        if build.sealed {
            return;
        }
        build.sealed = true;
        drop(build);
        let _ = var.settle(Err(err));
    }
}
