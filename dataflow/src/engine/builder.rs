//! Graph construction: lowering statements into tasks.
//!
//! A block is instantiated in three passes. Declarations first, so that
//! textual order never matters; then mappings, so every file variable has a
//! path (or a pending mapping) before anything refers to it; then the
//! statements themselves. Pure expressions whose inputs are already known
//! are folded here and never become tasks.
//!
//! Compound calls are inlined under a private scope whose parameters alias
//! the caller's variables. `foreach` over a known array is unrolled on the
//! spot and `if` on a known condition contributes only the taken branch;
//! otherwise both become deferred tasks that instantiate their bodies once
//! the control value settles.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::core::analysis::{TypeEnv, block_effects, escaping_effects, infer_type, stream_name};
use crate::core::expr::{PureOp, evaluate};
use crate::core::program::{
    AppTemplate, Arg, Expr, Mapping, ProcBody, Procedure, Stmt, Target, bind_arguments,
};
use crate::core::resource::parse_memory_mb;
use crate::core::value::{Operand, Value, VarId, VarType};
use crate::engine::run::{MappingKind, PendingPath, RunCore};
use crate::engine::scope::{Scope, ScopeId};
use crate::engine::store::VarState;
use crate::engine::task::{AppCall, Exports, Task, TaskKind};
use crate::error::EngineError;
use crate::io::mapper::MapRequest;

/// Types of the names visible from one scope.
struct ScopeTypes<'a, 'r> {
    core: &'a RunCore<'r>,
    scope: &'a Scope,
}

impl TypeEnv for ScopeTypes<'_, '_> {
    fn type_of(&self, name: &str) -> Option<VarType> {
        self.scope
            .lookup(name)
            .map(|var| self.core.store.var(var).ty().clone())
    }

    fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.core.program.procedure(name)
    }
}

impl RunCore<'_> {
    fn lookup(&self, scope: &Scope, name: &str) -> Result<VarId, EngineError> {
        scope.lookup(name).ok_or_else(|| {
            EngineError::dependency(format!("`{name}` is not bound in scope `{}`", scope.label()))
        })
    }

    fn procedure(&self, name: &str) -> Result<&Procedure, EngineError> {
        self.program
            .procedure(name)
            .ok_or_else(|| EngineError::invalid(format!("unknown procedure `{name}`")))
    }

    fn infer(&self, expr: &Expr, scope: &Scope) -> Result<VarType, EngineError> {
        infer_type(expr, &ScopeTypes { core: self, scope })
    }

    fn declare(&self, scope: &Scope, name: &str, ty: VarType) -> VarId {
        let qualified = if scope.id() == ScopeId(0) {
            name.to_string()
        } else {
            format!("{}/{name}", scope.label())
        };
        self.store.declare(qualified, ty, scope.id())
    }

    /// Engine-declared variable holding an intermediate result.
    fn temp(&self, ty: VarType, scope: &Scope) -> Result<VarId, EngineError> {
        let var = self.declare(scope, "_", ty.clone());
        if let VarType::File(file_type) = &ty {
            self.anonymous_path(var, file_type, scope.id())?;
        }
        Ok(var)
    }

    fn anonymous_path(&self, var: VarId, file_type: &str, scope: ScopeId) -> Result<(), EngineError> {
        let name = self.store.var(var).name().to_string();
        let request = MapRequest::Anonymous {
            name: name.rsplit('/').next().unwrap_or(&name).to_string(),
            file_type: if file_type.is_empty() {
                "file".to_string()
            } else {
                file_type.to_string()
            },
        };
        let path = self.mapper.assign(&request, &format!("{var} {name}"), scope)?;
        self.store.set_path(var, path);
        Ok(())
    }

    /// Operand of a variable: its value if already resolved.
    fn operand_of(&self, var: VarId) -> Operand {
        match self.store.state(var) {
            VarState::Resolved(value) => Operand::Lit(value),
            _ => Operand::Var(var),
        }
    }

    /// Variables that must settle before `operand` can be resolved.
    fn operand_deps(&self, operand: &Operand, deps: &mut Vec<VarId>) {
        match operand {
            Operand::Lit(_) => {}
            Operand::Var(var) => deps.push(*var),
            Operand::PathOf(var) => deps.extend(self.path_deps(*var)),
        }
    }

    /// Resolve a variable at build time, keeping the cached path of files.
    pub(crate) fn settle_now(&self, var: VarId, value: Value) -> Result<(), EngineError> {
        if let Value::File(path) = &value {
            self.store.set_path(var, path.clone());
        }
        self.store.set(var, value)
    }

    /// Instantiate `stmts` into `scope`. The caller owns the scope's build
    /// token.
    pub(crate) fn instantiate_block(
        &self,
        stmts: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        for stmt in stmts {
            if let Stmt::Declare { name, ty, .. } = stmt {
                let var = self.declare(scope, name, ty.clone());
                scope.bind(name, var);
            }
        }

        // Hold a writer token on every array this block fills element by
        // element, so it cannot settle while the block is still being built.
        let mut writers = Vec::new();
        for name in &block_effects(stmts).elements {
            if let Some(var) = scope.lookup(name) {
                self.store.add_writers(var, 1);
                writers.push(var);
            }
        }

        let result = self.instantiate_statements(stmts, scope);
        for var in writers {
            if let Err(err) = &result {
                self.store.poison(var, err.clone());
            }
            self.store.release_writer(var);
        }
        result
    }

    fn instantiate_statements(
        &self,
        stmts: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        for stmt in stmts {
            if let Stmt::Declare {
                name,
                ty: VarType::File(file_type),
                mapping,
                ..
            } = stmt
            {
                let var = self.lookup(scope, name)?;
                match mapping {
                    Some(mapping) => self.plan_mapping(var, mapping, scope)?,
                    None => self.anonymous_path(var, file_type, scope.id())?,
                }
            }
        }
        for stmt in stmts {
            self.instantiate_stmt(stmt, scope)?;
        }
        Ok(())
    }

    fn plan_mapping(
        &self,
        var: VarId,
        mapping: &Mapping,
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        let kind = match mapping {
            Mapping::Fixed { .. } => MappingKind::Fixed,
            Mapping::SinglePerRun { .. } => MappingKind::SinglePerRun,
            Mapping::Concurrent { .. } => MappingKind::Concurrent,
        };
        let operands = mapping
            .exprs()
            .into_iter()
            .map(|expr| self.lower(expr, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let owner = format!("{var} {}", self.store.var(var).name());
        self.mapped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(var);

        let known: Option<Vec<String>> = operands
            .iter()
            .map(|operand| operand.literal().map(Value::render))
            .collect();
        match known {
            Some(values) => {
                self.assign_path(var, kind, &values, &owner, scope.id())?;
            }
            None => {
                debug!(var = %var, "mapping deferred until its parameters settle");
                self.pending_paths
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(
                        var,
                        PendingPath {
                            kind,
                            operands,
                            owner,
                            scope: scope.id(),
                        },
                    );
            }
        }
        Ok(())
    }

    fn instantiate_stmt(&self, stmt: &Stmt, scope: &Arc<Scope>) -> Result<(), EngineError> {
        match stmt {
            Stmt::Declare {
                name,
                init: Some(init),
                ..
            } => {
                let var = self.lookup(scope, name)?;
                self.lower_into(init, var, scope)
            }
            Stmt::Declare { .. } => Ok(()),
            Stmt::Assign { target, value } => {
                let var = self.target_var(target, scope)?;
                self.lower_into(value, var, scope)
            }
            Stmt::Call {
                outputs,
                procedure,
                args,
            } => {
                let callee = self.procedure(procedure)?;
                let outputs = outputs
                    .iter()
                    .map(|target| self.target_var(target, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                self.instantiate_call(callee, args, outputs, scope)
            }
            Stmt::Foreach {
                var,
                index,
                over,
                body,
            } => self.instantiate_foreach(var, index.as_deref(), over, body, scope),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => match self.lower(cond, scope)? {
                Operand::Lit(Value::Bool(taken)) => {
                    let (branch, label) = if taken {
                        (then, "then")
                    } else {
                        (otherwise, "else")
                    };
                    self.instantiate_branch(branch, label, scope)
                }
                Operand::Lit(other) => Err(EngineError::mismatch(
                    "if condition",
                    VarType::Boolean,
                    other.shape(),
                )),
                cond => {
                    let mut effects = escaping_effects(then, &[]);
                    let other = escaping_effects(otherwise, &[]);
                    effects.definite.extend(other.definite);
                    effects.conditional.extend(other.conditional);
                    effects.elements.extend(other.elements);
                    let exports = self.exports(
                        effects.definite.iter().chain(&effects.conditional),
                        &effects.elements,
                        scope,
                    );
                    let mut deps = Vec::new();
                    self.operand_deps(&cond, &mut deps);
                    let mut task = Task::new(
                        "if",
                        Arc::clone(scope),
                        TaskKind::Guard {
                            cond,
                            then: then.clone(),
                            otherwise: otherwise.clone(),
                        },
                    )
                    .with_inputs(deps);
                    task.exports = exports;
                    self.submit(task);
                    Ok(())
                }
            },
            Stmt::Trace { args } => {
                let operands = args
                    .iter()
                    .map(|arg| self.lower(arg, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                let known: Option<Vec<Value>> = operands
                    .iter()
                    .map(|operand| operand.literal().cloned())
                    .collect();
                match known {
                    Some(values) => self.emit_trace(&values),
                    None => {
                        let mut deps = Vec::new();
                        operands
                            .iter()
                            .for_each(|operand| self.operand_deps(operand, &mut deps));
                        self.submit(
                            Task::new("trace", Arc::clone(scope), TaskKind::Trace {
                                args: operands,
                            })
                            .with_inputs(deps),
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Writer tokens and failure exports for a deferred construct.
    fn exports<'n>(
        &self,
        scalars: impl Iterator<Item = &'n String>,
        arrays: &BTreeSet<String>,
        scope: &Scope,
    ) -> Exports {
        let mut exports = Exports::default();
        for name in scalars {
            if let Some(var) = scope.lookup(name)
                && !exports.scalars.contains(&var)
            {
                exports.scalars.push(var);
            }
        }
        for name in arrays {
            if let Some(var) = scope.lookup(name) {
                self.store.add_writers(var, 1);
                exports.arrays.push(var);
            }
        }
        exports
    }

    fn instantiate_foreach(
        &self,
        var: &str,
        index: Option<&str>,
        over: &Expr,
        body: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        let element = match self.infer(over, scope)? {
            VarType::Array(element) => *element,
            other => return Err(EngineError::mismatch("foreach", "array", other)),
        };
        match self.lower(over, scope)? {
            Operand::Lit(Value::Array(items)) => {
                self.unroll(var, index, &element, &items, body, scope)
            }
            Operand::Lit(other) => Err(EngineError::mismatch("foreach", "array", other.shape())),
            over => {
                let bound: Vec<&str> = std::iter::once(var).chain(index).collect();
                let effects = escaping_effects(body, &bound);
                let exports = self.exports(
                    effects.definite.iter().chain(&effects.conditional),
                    &effects.elements,
                    scope,
                );
                let mut deps = Vec::new();
                self.operand_deps(&over, &mut deps);
                let mut task = Task::new(
                    format!("foreach {var}"),
                    Arc::clone(scope),
                    TaskKind::Foreach {
                        var: var.to_string(),
                        index: index.map(str::to_string),
                        element,
                        over,
                        body: body.to_vec(),
                    },
                )
                .with_inputs(deps);
                task.exports = exports;
                self.submit(task);
                Ok(())
            }
        }
    }

    /// Instantiate one private scope per element.
    #[instrument(skip_all, fields(var = %var, iterations = items.len()))]
    pub(crate) fn unroll(
        &self,
        var: &str,
        index: Option<&str>,
        element: &VarType,
        items: &[Value],
        body: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        for (position, item) in items.iter().enumerate() {
            let child = self.open_scope(scope, format!("{}[{position}]", scope_prefix(scope, var)));
            let result = self.instantiate_iteration(var, index, element, position, item, body, &child);
            self.release_scope(&child);
            result?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate_iteration(
        &self,
        var: &str,
        index: Option<&str>,
        element: &VarType,
        position: usize,
        item: &Value,
        body: &[Stmt],
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        let loop_var = self.declare(scope, var, element.clone());
        self.settle_now(loop_var, item.clone())?;
        scope.bind(var, loop_var);
        if let Some(index) = index {
            let index_var = self.declare(scope, index, VarType::Int);
            let position = i64::try_from(position)
                .map_err(|_| EngineError::Expression(format!("index {position} out of range")))?;
            self.store.set(index_var, Value::Int(position))?;
            scope.bind(index, index_var);
        }
        self.instantiate_block(body, scope)
    }

    /// Instantiate the taken branch of an `if` in its own scope.
    pub(crate) fn instantiate_branch(
        &self,
        branch: &[Stmt],
        label: &str,
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        if branch.is_empty() {
            return Ok(());
        }
        let child = self.open_scope(scope, format!("{}{label}", scope_prefix(scope, "if:")));
        let result = self.instantiate_block(branch, &child);
        self.release_scope(&child);
        result
    }

    /// Variable an assignment writes: a variable or one array element.
    fn target_var(&self, target: &Target, scope: &Arc<Scope>) -> Result<VarId, EngineError> {
        let var = self.lookup(scope, &target.name)?;
        let Some(index) = &target.index else {
            return Ok(var);
        };
        let index = match self.lower(index, scope)? {
            Operand::Lit(Value::Int(index)) => index,
            _ => {
                return Err(EngineError::invalid(format!(
                    "element index of `{}` is not known when the graph is built",
                    target.name
                )));
            }
        };
        let element = self.store.element(var, index)?;
        if let VarType::File(file_type) = self.store.var(element).ty().clone()
            && self.store.path(element).is_none()
        {
            self.anonymous_path(element, &file_type, self.store.var(var).scope())?;
        }
        Ok(element)
    }

    /// Lower an expression to an operand, creating tasks for whatever
    /// cannot be computed yet.
    pub(crate) fn lower(&self, expr: &Expr, scope: &Arc<Scope>) -> Result<Operand, EngineError> {
        match expr {
            Expr::Str(value) => Ok(Operand::Lit(Value::Str(value.clone()))),
            Expr::Int(value) => Ok(Operand::Lit(Value::Int(*value))),
            Expr::Bool(value) => Ok(Operand::Lit(Value::Bool(*value))),
            Expr::Var(name) => Ok(self.operand_of(self.lookup(scope, name)?)),
            Expr::Filename(name) => {
                let var = self.lookup(scope, name)?;
                Ok(match self.store.path(var) {
                    Some(path) => Operand::Lit(Value::Str(path.display().to_string())),
                    None => Operand::PathOf(var),
                })
            }
            Expr::Array(items) => self.pure(expr, PureOp::MakeArray, items.iter().collect(), scope),
            Expr::Index { array, index } => self.pure(expr, PureOp::Index, vec![&**array, &**index], scope),
            Expr::Strcat(parts) => self.pure(expr, PureOp::Strcat, parts.iter().collect(), scope),
            Expr::Regexp {
                text,
                pattern,
                replacement,
            } => self.pure(expr, PureOp::Regexp, vec![&**text, &**pattern, &**replacement], scope),
            Expr::Strsplit { text, pattern } => {
                self.pure(expr, PureOp::Strsplit, vec![&**text, &**pattern], scope)
            }
            Expr::Join { array, separator } => {
                self.pure(expr, PureOp::Join, vec![&**array, &**separator], scope)
            }
            Expr::Eq(a, b) => self.pure(expr, PureOp::Eq, vec![&**a, &**b], scope),
            Expr::Ne(a, b) => self.pure(expr, PureOp::Ne, vec![&**a, &**b], scope),
            Expr::And(a, b) => self.pure(expr, PureOp::And, vec![&**a, &**b], scope),
            Expr::Or(a, b) => self.pure(expr, PureOp::Or, vec![&**a, &**b], scope),
            Expr::Not(inner) => self.pure(expr, PureOp::Not, vec![&**inner], scope),
            Expr::WriteData(_) | Expr::ReadData(_) | Expr::Call { .. } => {
                let temp = self.temp(self.infer(expr, scope)?, scope)?;
                self.lower_into(expr, temp, scope)?;
                Ok(self.operand_of(temp))
            }
        }
    }

    /// Fold a pure operation now, or schedule it once its inputs settle.
    fn pure(
        &self,
        expr: &Expr,
        op: PureOp,
        args: Vec<&Expr>,
        scope: &Arc<Scope>,
    ) -> Result<Operand, EngineError> {
        let operands = args
            .into_iter()
            .map(|arg| self.lower(arg, scope))
            .collect::<Result<Vec<_>, _>>()?;
        let known: Option<Vec<Value>> = operands
            .iter()
            .map(|operand| operand.literal().cloned())
            .collect();
        if let Some(values) = known {
            return evaluate(op, &values).map(Operand::Lit);
        }
        let temp = self.temp(self.infer(expr, scope)?, scope)?;
        self.submit_eval(op, operands, temp, scope);
        Ok(Operand::Var(temp))
    }

    fn submit_eval(&self, op: PureOp, args: Vec<Operand>, output: VarId, scope: &Arc<Scope>) {
        let mut deps = Vec::new();
        args.iter()
            .for_each(|operand| self.operand_deps(operand, &mut deps));
        self.submit(
            Task::new(op.name(), Arc::clone(scope), TaskKind::Eval { op, args })
                .with_inputs(deps)
                .with_outputs(vec![output]),
        );
    }

    /// Lower an expression whose result is assigned to `target`.
    pub(crate) fn lower_into(
        &self,
        expr: &Expr,
        target: VarId,
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        match expr {
            Expr::Call { procedure, args } => {
                let callee = self.procedure(procedure)?;
                self.instantiate_call(callee, args, vec![target], scope)
            }
            Expr::WriteData(inner) => {
                let text = self.lower(inner, scope)?;
                let mut deps = self.path_deps(target);
                self.operand_deps(&text, &mut deps);
                self.submit(
                    Task::new("write_data", Arc::clone(scope), TaskKind::WriteData { text })
                        .with_inputs(deps)
                        .with_outputs(vec![target]),
                );
                Ok(())
            }
            Expr::ReadData(inner) => {
                let file = self.lower(inner, scope)?;
                let mut deps = Vec::new();
                self.operand_deps(&file, &mut deps);
                self.submit(
                    Task::new("read_data", Arc::clone(scope), TaskKind::ReadData { file })
                        .with_inputs(deps)
                        .with_outputs(vec![target]),
                );
                Ok(())
            }
            Expr::Var(name) if self.store.var(target).ty().is_file() && self.is_mapped(target) => {
                let source = self.operand_of(self.lookup(scope, name)?);
                let mut deps = self.path_deps(target);
                self.operand_deps(&source, &mut deps);
                self.submit(
                    Task::new("copy", Arc::clone(scope), TaskKind::Copy { source })
                        .with_inputs(deps)
                        .with_outputs(vec![target]),
                );
                Ok(())
            }
            _ => match self.lower(expr, scope)? {
                Operand::Lit(value) => self.settle_now(target, value),
                operand => {
                    self.submit_eval(PureOp::Identity, vec![operand], target, scope);
                    Ok(())
                }
            },
        }
    }

    fn is_mapped(&self, var: VarId) -> bool {
        self.mapped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&var)
    }

    /// Bind arguments and instantiate a call whose results go to `outputs`.
    #[instrument(skip_all, fields(procedure = %callee.name))]
    pub(crate) fn instantiate_call(
        &self,
        callee: &Procedure,
        args: &[Arg],
        outputs: Vec<VarId>,
        scope: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        let bound = bind_arguments(callee, args)?;
        if outputs.len() != callee.outputs.len() {
            return Err(EngineError::invalid(format!(
                "`{}` has {} outputs but the call binds {}",
                callee.name,
                callee.outputs.len(),
                outputs.len()
            )));
        }
        let label = match &callee.body {
            ProcBody::Compound(_) => callee.name.clone(),
            ProcBody::App(_) => format!("{}()", callee.name),
        };
        let child = self.open_scope(scope, format!("{}{label}", scope_prefix(scope, "")));
        let result = self.instantiate_callee(callee, &bound, &outputs, scope, &child);
        self.release_scope(&child);
        result
    }

    fn instantiate_callee(
        &self,
        callee: &Procedure,
        bound: &[&Expr],
        outputs: &[VarId],
        caller: &Arc<Scope>,
        params: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        for (param, expr) in callee.inputs.iter().zip(bound) {
            let var = match self.lower(expr, caller)? {
                Operand::Var(var) => var,
                Operand::Lit(value) => {
                    let var = self.declare(params, &param.name, param.ty.clone());
                    self.settle_now(var, value)?;
                    var
                }
                path @ Operand::PathOf(_) => {
                    let var = self.declare(params, &param.name, param.ty.clone());
                    self.submit_eval(PureOp::Identity, vec![path], var, caller);
                    var
                }
            };
            params.bind(&param.name, var);
        }
        for (param, output) in callee.outputs.iter().zip(outputs) {
            params.bind(&param.name, *output);
        }
        match &callee.body {
            ProcBody::Compound(body) => self.instantiate_block(body, params),
            ProcBody::App(template) => self.submit_app(callee, template, outputs, params),
        }
    }

    fn submit_app(
        &self,
        callee: &Procedure,
        template: &AppTemplate,
        outputs: &[VarId],
        params: &Arc<Scope>,
    ) -> Result<(), EngineError> {
        let output_names: Vec<&str> = callee.outputs.iter().map(|p| p.name.as_str()).collect();
        let argv = template
            .arguments
            .iter()
            .map(|arg| self.lower(&outputs_as_paths(arg, &output_names), params))
            .collect::<Result<Vec<_>, _>>()?;
        let stdin = match template.stdin.as_ref().and_then(stream_name) {
            Some(name) => Some(self.operand_of(self.lookup(params, name)?)),
            None => None,
        };
        let stdout = match template.stdout.as_ref().and_then(stream_name) {
            Some(name) => Some(self.lookup(params, name)?),
            None => None,
        };
        let weight_mb = match &template.resource {
            Some(hint) => parse_memory_mb(hint)?,
            None => 0,
        };

        let mut deps = Vec::new();
        for operand in argv.iter().chain(stdin.iter()) {
            self.operand_deps(operand, &mut deps);
        }
        for output in outputs {
            deps.extend(self.path_deps(*output));
        }
        let call = AppCall {
            procedure: callee.name.clone(),
            executable: template.executable.clone(),
            argv,
            stdin,
            stdout,
            timeout: template
                .timeout_secs
                .map(Duration::from_secs)
                .or(self.settings.task_timeout),
        };
        let mut task = Task::new(callee.name.clone(), Arc::clone(params), TaskKind::App(call))
            .with_inputs(deps)
            .with_outputs(outputs.to_vec());
        task.weight_mb = weight_mb;
        self.submit(task);
        Ok(())
    }
}

/// Label prefix for child scopes: nothing under the root.
fn scope_prefix(scope: &Scope, suffix: &str) -> String {
    if scope.id() == ScopeId(0) {
        suffix.to_string()
    } else {
        format!("{}/{suffix}", scope.label())
    }
}

/// An app's outputs appear in its command line as paths, never as values
/// (the values only exist once the app has run).
fn outputs_as_paths(expr: &Expr, outputs: &[&str]) -> Expr {
    let map = |inner: &Expr| Box::new(outputs_as_paths(inner, outputs));
    match expr {
        Expr::Var(name) if outputs.contains(&name.as_str()) => Expr::Filename(name.clone()),
        Expr::Array(items) => Expr::Array(items.iter().map(|e| outputs_as_paths(e, outputs)).collect()),
        Expr::Strcat(parts) => {
            Expr::Strcat(parts.iter().map(|e| outputs_as_paths(e, outputs)).collect())
        }
        Expr::Index { array, index } => Expr::Index {
            array: map(array),
            index: map(index),
        },
        Expr::Regexp {
            text,
            pattern,
            replacement,
        } => Expr::Regexp {
            text: map(text),
            pattern: map(pattern),
            replacement: map(replacement),
        },
        Expr::Strsplit { text, pattern } => Expr::Strsplit {
            text: map(text),
            pattern: map(pattern),
        },
        Expr::Join { array, separator } => Expr::Join {
            array: map(array),
            separator: map(separator),
        },
        Expr::Eq(a, b) => Expr::Eq(map(a), map(b)),
        Expr::Ne(a, b) => Expr::Ne(map(a), map(b)),
        Expr::And(a, b) => Expr::And(map(a), map(b)),
        Expr::Or(a, b) => Expr::Or(map(a), map(b)),
        Expr::Not(inner) => Expr::Not(map(inner)),
        other => other.clone(),
    }
}
