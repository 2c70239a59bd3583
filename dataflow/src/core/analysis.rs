//! Build-time validation of a [`Program`].
//!
//! Everything here runs before a single task is scheduled, so that a script
//! which could never finish fails with a diagnostic instead of a hang:
//!
//! - every name read has a producer somewhere in its reachable scope chain
//!   (textual order does not matter in a dataflow program);
//! - a name produced only by one branch of an `if` is not read outside it;
//! - no variable is assigned twice, including from several `foreach`
//!   iterations (each iteration gets a private scope instead);
//! - expression and argument types match the declarations;
//! - statements of one block do not depend on each other cyclically;
//! - procedures are not recursive (calls are inlined).

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::graph::DependencyGraph;
use crate::core::program::{
    AppTemplate, Arg, Expr, Param, ProcBody, Procedure, Program, Stmt, Target, bind_arguments,
};
use crate::core::resource::parse_memory_mb;
use crate::core::value::VarType;
use crate::error::EngineError;

/// Type lookup used by [`infer_type`].
pub trait TypeEnv {
    fn type_of(&self, name: &str) -> Option<VarType>;
    fn procedure(&self, name: &str) -> Option<&Procedure>;
}

/// Names a block assigns, split by how certainly they are produced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Effects {
    /// Assigned on every path through the block.
    pub definite: BTreeSet<String>,
    /// Assigned by only one branch of some `if`.
    pub conditional: BTreeSet<String>,
    /// Arrays that receive element assignments.
    pub elements: BTreeSet<String>,
}

impl Effects {
    fn record(&mut self, target: &Target) {
        if target.index.is_some() {
            self.elements.insert(target.name.clone());
        } else {
            self.definite.insert(target.name.clone());
        }
    }

    fn without(mut self, locals: &BTreeSet<String>) -> Self {
        self.definite.retain(|name| !locals.contains(name));
        self.conditional.retain(|name| !locals.contains(name));
        self.elements.retain(|name| !locals.contains(name));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.definite.is_empty() && self.conditional.is_empty() && self.elements.is_empty()
    }
}

/// Effects of a block, including names declared inside it.
pub fn block_effects(stmts: &[Stmt]) -> Effects {
    collect_effects(stmts, &mut Vec::new())
}

/// Effects of a nested body as seen from the enclosing scope: names declared
/// inside the body (and loop bindings) are removed.
pub fn escaping_effects(stmts: &[Stmt], bound: &[&str]) -> Effects {
    let mut locals = declared_in(stmts);
    locals.extend(bound.iter().map(|name| name.to_string()));
    block_effects(stmts).without(&locals)
}

fn collect_effects(stmts: &[Stmt], conflicts: &mut Vec<String>) -> Effects {
    let mut acc = Effects::default();
    for stmt in stmts {
        let effect = stmt_effects(stmt, conflicts);
        for name in effect.definite.iter().chain(&effect.conditional) {
            if acc.definite.contains(name) || acc.conditional.contains(name) {
                conflicts.push(name.clone());
            }
        }
        acc.definite.extend(effect.definite);
        acc.conditional.extend(effect.conditional);
        acc.elements.extend(effect.elements);
    }
    acc
}

fn stmt_effects(stmt: &Stmt, conflicts: &mut Vec<String>) -> Effects {
    let mut effect = Effects::default();
    match stmt {
        Stmt::Declare {
            name,
            init: Some(_),
            ..
        } => {
            effect.definite.insert(name.clone());
        }
        Stmt::Declare { .. } | Stmt::Trace { .. } => {}
        Stmt::Assign { target, .. } => effect.record(target),
        Stmt::Call { outputs, .. } => {
            for target in outputs {
                if target.index.is_none() && effect.definite.contains(&target.name) {
                    conflicts.push(target.name.clone());
                }
                effect.record(target);
            }
        }
        Stmt::Foreach {
            var, index, body, ..
        } => {
            let mut locals = declared_in(body);
            locals.insert(var.clone());
            locals.extend(index.iter().cloned());
            let inner = collect_effects(body, conflicts).without(&locals);
            // One private scope per iteration: an outer scalar would be
            // assigned once per element.
            conflicts.extend(inner.definite.iter().chain(&inner.conditional).cloned());
            effect.elements = inner.elements;
        }
        Stmt::If {
            then, otherwise, ..
        } => {
            let then = collect_effects(then, conflicts).without(&declared_in(then));
            let otherwise = collect_effects(otherwise, conflicts).without(&declared_in(otherwise));
            effect.definite = then
                .definite
                .intersection(&otherwise.definite)
                .cloned()
                .collect();
            effect.conditional = then
                .definite
                .iter()
                .chain(&then.conditional)
                .chain(&otherwise.definite)
                .chain(&otherwise.conditional)
                .filter(|name| !effect.definite.contains(*name))
                .cloned()
                .collect();
            effect.elements = then.elements.union(&otherwise.elements).cloned().collect();
        }
    }
    effect
}

fn declared_in(stmts: &[Stmt]) -> BTreeSet<String> {
    stmts
        .iter()
        .filter_map(Stmt::declared_name)
        .map(str::to_string)
        .collect()
}

/// Names read by a statement, excluding names local to its nested blocks.
fn stmt_reads(stmt: &Stmt) -> BTreeSet<String> {
    let mut reads = Vec::new();
    match stmt {
        Stmt::Declare { mapping, init, .. } => {
            if let Some(mapping) = mapping {
                mapping.exprs().iter().for_each(|expr| expr.reads(&mut reads));
            }
            if let Some(init) = init {
                init.reads(&mut reads);
            }
        }
        Stmt::Assign { target, value } => {
            value.reads(&mut reads);
            if let Some(index) = &target.index {
                index.reads(&mut reads);
            }
        }
        Stmt::Call { outputs, args, .. } => {
            args.iter().for_each(|arg| arg.value.reads(&mut reads));
            outputs
                .iter()
                .filter_map(|target| target.index.as_ref())
                .for_each(|index| index.reads(&mut reads));
        }
        Stmt::Foreach {
            var,
            index,
            over,
            body,
        } => {
            over.reads(&mut reads);
            let mut locals = declared_in(body);
            locals.insert(var.clone());
            locals.extend(index.iter().cloned());
            reads.extend(block_reads(body).into_iter().filter(|n| !locals.contains(n)));
        }
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            cond.reads(&mut reads);
            reads.extend(block_reads(then));
            reads.extend(block_reads(otherwise));
        }
        Stmt::Trace { args } => args.iter().for_each(|arg| arg.reads(&mut reads)),
    }
    reads.into_iter().collect()
}

/// Reads of a nested block that reach outside it. Scalars the block both
/// assigns and reads are internal to it.
fn block_reads(stmts: &[Stmt]) -> BTreeSet<String> {
    let mut locals = declared_in(stmts);
    let effects = block_effects(stmts);
    locals.extend(effects.definite);
    locals.extend(effects.conditional);
    stmts
        .iter()
        .flat_map(stmt_reads)
        .filter(|name| !locals.contains(name))
        .collect()
}

/// Procedure names called anywhere in a block.
fn calls_in(stmts: &[Stmt], out: &mut BTreeSet<String>) {
    fn expr_calls(expr: &Expr, out: &mut BTreeSet<String>) {
        match expr {
            Expr::Call { procedure, args } => {
                out.insert(procedure.clone());
                args.iter().for_each(|arg| expr_calls(&arg.value, out));
            }
            Expr::Array(items) | Expr::Strcat(items) => {
                items.iter().for_each(|item| expr_calls(item, out));
            }
            Expr::Index { array: a, index: b }
            | Expr::Strsplit { text: a, pattern: b }
            | Expr::Join {
                array: a,
                separator: b,
            }
            | Expr::Eq(a, b)
            | Expr::Ne(a, b)
            | Expr::And(a, b)
            | Expr::Or(a, b) => {
                expr_calls(a, out);
                expr_calls(b, out);
            }
            Expr::Regexp {
                text,
                pattern,
                replacement,
            } => {
                expr_calls(text, out);
                expr_calls(pattern, out);
                expr_calls(replacement, out);
            }
            Expr::Not(inner) | Expr::WriteData(inner) | Expr::ReadData(inner) => {
                expr_calls(inner, out);
            }
            Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Filename(_) => {}
        }
    }

    for stmt in stmts {
        match stmt {
            Stmt::Declare { init, .. } => {
                if let Some(init) = init {
                    expr_calls(init, out);
                }
            }
            Stmt::Assign { value, .. } => expr_calls(value, out),
            Stmt::Call {
                procedure, args, ..
            } => {
                out.insert(procedure.clone());
                args.iter().for_each(|arg| expr_calls(&arg.value, out));
            }
            Stmt::Foreach { over, body, .. } => {
                expr_calls(over, out);
                calls_in(body, out);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                expr_calls(cond, out);
                calls_in(then, out);
                calls_in(otherwise, out);
            }
            Stmt::Trace { args } => args.iter().for_each(|arg| expr_calls(arg, out)),
        }
    }
}

fn non_array(ty: &VarType, context: &str) -> Result<(), EngineError> {
    if ty.is_array() {
        return Err(EngineError::mismatch(context, "scalar", ty));
    }
    Ok(())
}

/// Infer the type of an expression, checking operand types on the way.
pub fn infer_type(expr: &Expr, env: &dyn TypeEnv) -> Result<VarType, EngineError> {
    let infer = |expr: &Expr| infer_type(expr, env);
    match expr {
        Expr::Str(_) => Ok(VarType::String),
        Expr::Int(_) => Ok(VarType::Int),
        Expr::Bool(_) => Ok(VarType::Boolean),
        Expr::Var(name) => env
            .type_of(name)
            .ok_or_else(|| EngineError::dependency(format!("`{name}` is not declared"))),
        Expr::Array(items) => {
            let mut element = None;
            for item in items {
                let ty = infer(item)?;
                match &element {
                    None => element = Some(ty),
                    Some(expected) if expected.accepts(&ty) => {}
                    Some(expected) => return Err(EngineError::mismatch("array literal", expected, ty)),
                }
            }
            Ok(VarType::Array(Box::new(element.unwrap_or(VarType::String))))
        }
        Expr::Index { array, index } => {
            let array_ty = infer(array)?;
            let index_ty = infer(index)?;
            if index_ty != VarType::Int {
                return Err(EngineError::mismatch("array index", VarType::Int, index_ty));
            }
            array_ty
                .element()
                .cloned()
                .ok_or_else(|| EngineError::mismatch("indexed value", "array", &array_ty))
        }
        Expr::Strcat(parts) => {
            for part in parts {
                non_array(&infer(part)?, "strcat argument")?;
            }
            Ok(VarType::String)
        }
        Expr::Regexp {
            text,
            pattern,
            replacement,
        } => {
            non_array(&infer(text)?, "regexp text")?;
            non_array(&infer(pattern)?, "regexp pattern")?;
            non_array(&infer(replacement)?, "regexp replacement")?;
            Ok(VarType::String)
        }
        Expr::Strsplit { text, pattern } => {
            non_array(&infer(text)?, "strsplit text")?;
            non_array(&infer(pattern)?, "strsplit pattern")?;
            Ok(VarType::Array(Box::new(VarType::String)))
        }
        Expr::Join { array, separator } => {
            let array_ty = infer(array)?;
            match array_ty.element() {
                Some(element) => non_array(element, "join element")?,
                None => return Err(EngineError::mismatch("join", "array", &array_ty)),
            }
            non_array(&infer(separator)?, "join separator")?;
            Ok(VarType::String)
        }
        Expr::Filename(name) => match env.type_of(name) {
            Some(ty) if ty.is_file() => Ok(VarType::String),
            Some(ty) => Err(EngineError::mismatch(format!("filename({name})"), "file", ty)),
            None => Err(EngineError::dependency(format!("`{name}` is not declared"))),
        },
        Expr::Eq(a, b) | Expr::Ne(a, b) => {
            let (a, b) = (infer(a)?, infer(b)?);
            if !a.accepts(&b) && !b.accepts(&a) {
                return Err(EngineError::mismatch("comparison", a, b));
            }
            Ok(VarType::Boolean)
        }
        Expr::And(a, b) | Expr::Or(a, b) => {
            for side in [a, b] {
                let ty = infer(side)?;
                if ty != VarType::Boolean {
                    return Err(EngineError::mismatch("logical operand", VarType::Boolean, ty));
                }
            }
            Ok(VarType::Boolean)
        }
        Expr::Not(inner) => match infer(inner)? {
            VarType::Boolean => Ok(VarType::Boolean),
            other => Err(EngineError::mismatch("logical operand", VarType::Boolean, other)),
        },
        Expr::WriteData(inner) => {
            non_array(&infer(inner)?, "write_data")?;
            Ok(VarType::File(String::new()))
        }
        Expr::ReadData(inner) => match infer(inner)? {
            ty if ty.is_file() => Ok(VarType::String),
            other => Err(EngineError::mismatch("read_data", "file", other)),
        },
        Expr::Call { procedure, args } => {
            let callee = env
                .procedure(procedure)
                .ok_or_else(|| EngineError::invalid(format!("unknown procedure `{procedure}`")))?;
            if callee.outputs.len() != 1 {
                return Err(EngineError::invalid(format!(
                    "`{procedure}` has {} outputs and cannot be used as an expression",
                    callee.outputs.len()
                )));
            }
            check_call_args(callee, args, env)?;
            Ok(callee.outputs[0].ty.clone())
        }
    }
}

/// Bind a call's arguments and check each against its parameter type.
pub fn check_call_args(
    callee: &Procedure,
    args: &[Arg],
    env: &dyn TypeEnv,
) -> Result<(), EngineError> {
    let bound = bind_arguments(callee, args)?;
    for (param, expr) in callee.inputs.iter().zip(bound) {
        let found = infer_type(expr, env)?;
        if !param.ty.accepts(&found) {
            return Err(EngineError::mismatch(
                format!("{}.{}", callee.name, param.name),
                &param.ty,
                found,
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Declared,
    Input,
    Output,
    Loop,
    LoopIndex,
}

#[derive(Debug, Clone)]
struct Binding {
    ty: VarType,
    origin: Origin,
}

#[derive(Debug, Default)]
struct Frame {
    bindings: HashMap<String, Binding>,
    produced: BTreeSet<String>,
    conditional: BTreeSet<String>,
    elements: BTreeSet<String>,
}

struct Analyzer<'p> {
    program: &'p Program,
    frames: Vec<Frame>,
    errors: Vec<EngineError>,
}

impl TypeEnv for Analyzer<'_> {
    fn type_of(&self, name: &str) -> Option<VarType> {
        self.lookup(name).map(|binding| binding.ty.clone())
    }

    fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.program.procedure(name)
    }
}

/// Run every build-time check and return all diagnostics.
pub fn analyze(program: &Program) -> Vec<EngineError> {
    let mut analyzer = Analyzer {
        program,
        frames: Vec::new(),
        errors: Vec::new(),
    };
    analyzer.check_declarations();
    for procedure in &program.procedures {
        analyzer.check_procedure(procedure);
    }
    analyzer.check_main();
    analyzer.errors
}

/// Run every build-time check and return the first diagnostic.
pub fn check_program(program: &Program) -> Result<(), EngineError> {
    match analyze(program).into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

impl Analyzer<'_> {
    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.frames
            .iter()
            .rev()
            .find_map(|frame| frame.bindings.get(name))
    }

    fn check_declarations(&mut self) {
        let mut seen = HashSet::new();
        for procedure in &self.program.procedures {
            if !seen.insert(procedure.name.as_str()) {
                self.errors.push(EngineError::invalid(format!(
                    "procedure `{}` is defined more than once",
                    procedure.name
                )));
            }
        }
        for name in &self.program.types {
            match name.parse::<VarType>() {
                Ok(VarType::File(_)) => {}
                _ => self
                    .errors
                    .push(EngineError::invalid(format!("`{name}` is not a valid file type name"))),
            }
        }

        let mut graph = DependencyGraph::new();
        for procedure in &self.program.procedures {
            if let ProcBody::Compound(body) = &procedure.body {
                let mut callees = BTreeSet::new();
                calls_in(body, &mut callees);
                for callee in callees {
                    graph.add_edge(&procedure.name, &callee);
                }
            }
        }
        if let Some(cycle) = graph.find_cycle() {
            self.errors.push(EngineError::invalid(format!(
                "recursive procedures cannot be inlined: {}",
                cycle.join(", ")
            )));
        }
    }

    fn check_type_name(&mut self, ty: &VarType) {
        match ty {
            VarType::File(name) if !self.program.types.iter().any(|t| t == name) => {
                self.errors
                    .push(EngineError::invalid(format!("unknown type `{name}`")));
            }
            VarType::Array(inner) => self.check_type_name(inner),
            _ => {}
        }
    }

    fn check_params(&mut self, owner: &str, params: &[Param]) {
        let mut seen = HashSet::new();
        for param in params {
            self.check_type_name(&param.ty);
            if !seen.insert(param.name.as_str()) {
                self.errors.push(EngineError::invalid(format!(
                    "`{}` is declared more than once in `{owner}`",
                    param.name
                )));
            }
            if let Some(default) = &param.default {
                let literal_ty = match default {
                    Expr::Str(_) => Some(VarType::String),
                    Expr::Int(_) => Some(VarType::Int),
                    Expr::Bool(_) => Some(VarType::Boolean),
                    _ => None,
                };
                match literal_ty {
                    Some(ty) if param.ty.accepts(&ty) => {}
                    Some(ty) => self
                        .errors
                        .push(EngineError::mismatch(&param.name, &param.ty, ty)),
                    None => self.errors.push(EngineError::invalid(format!(
                        "default of `{}` in `{owner}` must be a literal",
                        param.name
                    ))),
                }
            }
        }
    }

    fn report_conflicts(&mut self, body: &[Stmt]) {
        let mut conflicts = Vec::new();
        collect_effects(body, &mut conflicts);
        let unique: BTreeSet<String> = conflicts.into_iter().collect();
        for variable in unique {
            self.errors.push(EngineError::DoubleAssignment { variable });
        }
    }

    fn check_main(&mut self) {
        let program = self.program;
        self.check_params("main", &program.params);
        let bindings = program
            .params
            .iter()
            .map(|param| {
                (
                    param.name.clone(),
                    Binding {
                        ty: param.ty.clone(),
                        origin: Origin::Input,
                    },
                )
            })
            .collect();
        self.report_conflicts(&program.main);
        self.check_block(&program.main, bindings);
    }

    fn check_procedure(&mut self, procedure: &Procedure) {
        self.check_params(&procedure.name, &procedure.inputs);
        self.check_params(&procedure.name, &procedure.outputs);
        let mut bindings: HashMap<String, Binding> = HashMap::new();
        for param in &procedure.inputs {
            bindings.insert(
                param.name.clone(),
                Binding {
                    ty: param.ty.clone(),
                    origin: Origin::Input,
                },
            );
        }
        for param in &procedure.outputs {
            if bindings.contains_key(&param.name) {
                self.errors.push(EngineError::invalid(format!(
                    "`{}` is both an input and an output of `{}`",
                    param.name, procedure.name
                )));
            }
            bindings.insert(
                param.name.clone(),
                Binding {
                    ty: param.ty.clone(),
                    origin: Origin::Output,
                },
            );
        }

        match &procedure.body {
            ProcBody::App(template) => self.check_app(procedure, template, bindings),
            ProcBody::Compound(body) => {
                self.report_conflicts(body);
                self.check_block(body, bindings);
                let effects = block_effects(body);
                for output in &procedure.outputs {
                    let produced = effects.definite.contains(&output.name)
                        || (output.ty.is_array() && effects.elements.contains(&output.name));
                    if !produced {
                        self.errors.push(EngineError::dependency(format!(
                            "output `{}` of `{}` is never assigned on every path",
                            output.name, procedure.name
                        )));
                    }
                }
            }
        }
    }

    fn check_app(
        &mut self,
        procedure: &Procedure,
        template: &AppTemplate,
        bindings: HashMap<String, Binding>,
    ) {
        for output in &procedure.outputs {
            if !output.ty.is_file() {
                self.errors.push(EngineError::invalid(format!(
                    "output `{}` of app `{}` must be a file, not {}",
                    output.name, procedure.name, output.ty
                )));
            }
        }
        if let Some(resource) = &template.resource
            && let Err(err) = parse_memory_mb(resource)
        {
            self.errors.push(err);
        }

        let produced = procedure.outputs.iter().map(|p| p.name.clone()).collect();
        self.frames.push(Frame {
            bindings,
            produced,
            ..Frame::default()
        });
        for arg in &template.arguments {
            if materializes(arg) {
                self.errors.push(EngineError::invalid(format!(
                    "arguments of app `{}` cannot call procedures or materialize data",
                    procedure.name
                )));
                continue;
            }
            self.check_expr(arg);
        }
        if let Some(stdin) = &template.stdin {
            let ok = stream_name(stdin)
                .and_then(|name| self.lookup(name))
                .is_some_and(|b| b.ty.is_file() && b.origin == Origin::Input);
            if !ok {
                self.errors.push(EngineError::invalid(format!(
                    "stdin of app `{}` must name a file input",
                    procedure.name
                )));
            }
        }
        if let Some(stdout) = &template.stdout {
            let ok = stream_name(stdout)
                .and_then(|name| self.lookup(name))
                .is_some_and(|b| b.ty.is_file() && b.origin == Origin::Output);
            if !ok {
                self.errors.push(EngineError::invalid(format!(
                    "stdout of app `{}` must name a file output",
                    procedure.name
                )));
            }
        }
        self.frames.pop();
    }

    fn check_block(&mut self, stmts: &[Stmt], bindings: HashMap<String, Binding>) {
        let effects = block_effects(stmts);
        let mut frame = Frame {
            bindings,
            produced: effects.definite.clone(),
            conditional: effects.conditional.clone(),
            elements: effects.elements.clone(),
        };

        for stmt in stmts {
            if let Stmt::Declare { name, ty, .. } = stmt {
                self.check_type_name(ty);
                if frame.bindings.contains_key(name) {
                    self.errors.push(EngineError::invalid(format!(
                        "`{name}` is declared more than once in the same scope"
                    )));
                    continue;
                }
                frame.bindings.insert(
                    name.clone(),
                    Binding {
                        ty: ty.clone(),
                        origin: Origin::Declared,
                    },
                );
            }
        }

        let mut shape_errors = Vec::new();
        for (name, binding) in &frame.bindings {
            if !matches!(binding.origin, Origin::Declared | Origin::Output)
                || !effects.elements.contains(name)
            {
                continue;
            }
            if !binding.ty.is_array() {
                shape_errors.push(EngineError::mismatch(name, "array", &binding.ty));
            } else if effects.definite.contains(name) || effects.conditional.contains(name) {
                shape_errors.push(EngineError::DoubleAssignment {
                    variable: name.clone(),
                });
            }
        }
        self.errors.extend(shape_errors);

        self.frames.push(frame);
        self.check_cycles(stmts);
        for stmt in stmts {
            self.check_stmt(stmt);
        }
        self.frames.pop();
    }

    fn check_cycles(&mut self, stmts: &[Stmt]) {
        let mut graph = DependencyGraph::new();
        for stmt in stmts {
            let effect = stmt_effects(stmt, &mut Vec::new());
            let reads = stmt_reads(stmt);
            for write in effect
                .definite
                .iter()
                .chain(&effect.conditional)
                .chain(&effect.elements)
            {
                for read in &reads {
                    graph.add_edge(read, write);
                }
            }
        }
        if let Some(cycle) = graph.find_cycle() {
            self.errors.push(EngineError::dependency(format!(
                "cyclic dependency between {}",
                cycle.join(", ")
            )));
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Declare {
                name,
                ty,
                mapping,
                init,
            } => {
                if let Some(mapping) = mapping {
                    if !ty.is_file() {
                        self.errors.push(EngineError::invalid(format!(
                            "`{name}` has a file mapping but type {ty}"
                        )));
                    }
                    for expr in mapping.exprs() {
                        if let Some(found) = self.check_expr(expr)
                            && found.is_array()
                        {
                            self.errors
                                .push(EngineError::mismatch(format!("mapping of {name}"), "scalar", found));
                        }
                    }
                }
                if let Some(init) = init {
                    self.check_assignment(&Target::var(name), init);
                }
            }
            Stmt::Assign { target, value } => self.check_assignment(target, value),
            Stmt::Call {
                outputs,
                procedure,
                args,
            } => self.check_call_stmt(outputs, procedure, args),
            Stmt::Foreach {
                var,
                index,
                over,
                body,
            } => {
                let Some(over_ty) = self.check_expr(over) else {
                    return;
                };
                let Some(element) = over_ty.element().cloned() else {
                    self.errors
                        .push(EngineError::mismatch("foreach", "array", over_ty));
                    return;
                };
                let mut bindings = HashMap::new();
                bindings.insert(
                    var.clone(),
                    Binding {
                        ty: element,
                        origin: Origin::Loop,
                    },
                );
                if let Some(index) = index {
                    bindings.insert(
                        index.clone(),
                        Binding {
                            ty: VarType::Int,
                            origin: Origin::LoopIndex,
                        },
                    );
                }
                self.check_block(body, bindings);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if let Some(ty) = self.check_expr(cond)
                    && ty != VarType::Boolean
                {
                    self.errors
                        .push(EngineError::mismatch("if condition", VarType::Boolean, ty));
                }
                self.check_block(then, HashMap::new());
                self.check_block(otherwise, HashMap::new());
            }
            Stmt::Trace { args } => {
                for arg in args {
                    self.check_expr(arg);
                }
            }
        }
    }

    /// Check that every read has a producer, then infer the type.
    fn check_expr(&mut self, expr: &Expr) -> Option<VarType> {
        let before = self.errors.len();
        let mut reads = Vec::new();
        expr.reads(&mut reads);
        for name in reads {
            self.require_produced(&name);
        }
        match infer_type(expr, &*self) {
            Ok(ty) => Some(ty),
            Err(err) => {
                if self.errors.len() == before {
                    self.errors.push(err);
                }
                None
            }
        }
    }

    fn require_produced(&mut self, name: &str) {
        let mut produced_below = false;
        for frame in self.frames.iter().rev() {
            let produced_here = frame.produced.contains(name) || frame.elements.contains(name);
            if let Some(binding) = frame.bindings.get(name) {
                if matches!(
                    binding.origin,
                    Origin::Input | Origin::Loop | Origin::LoopIndex
                ) || produced_here
                    || produced_below
                {
                    return;
                }
                let message = if frame.conditional.contains(name) {
                    format!(
                        "`{name}` is only produced inside a conditional branch and cannot be read outside it"
                    )
                } else {
                    format!("`{name}` is read but never assigned in its scope")
                };
                self.errors.push(EngineError::dependency(message));
                return;
            }
            produced_below |= produced_here;
        }
        self.errors
            .push(EngineError::dependency(format!("`{name}` is not declared")));
    }

    fn check_target(&mut self, target: &Target) -> Option<VarType> {
        let Some(binding) = self.lookup(&target.name).cloned() else {
            self.errors.push(EngineError::dependency(format!(
                "`{}` is not declared",
                target.name
            )));
            return None;
        };
        if !matches!(binding.origin, Origin::Declared | Origin::Output) {
            self.errors.push(EngineError::DoubleAssignment {
                variable: target.name.clone(),
            });
            return None;
        }
        let Some(index) = &target.index else {
            return Some(binding.ty);
        };
        let static_index = match index {
            Expr::Int(_) => true,
            Expr::Var(name) => self
                .lookup(name)
                .is_some_and(|b| b.origin == Origin::LoopIndex),
            _ => false,
        };
        if !static_index {
            self.errors.push(EngineError::invalid(format!(
                "element index of `{}` must be an int literal or a foreach index",
                target.name
            )));
            return None;
        }
        match binding.ty.element() {
            Some(element) => Some(element.clone()),
            None => {
                self.errors
                    .push(EngineError::mismatch(&target.name, "array", binding.ty));
                None
            }
        }
    }

    fn check_assignment(&mut self, target: &Target, value: &Expr) {
        let target_ty = self.check_target(target);
        let found = self.check_expr(value);
        if let (Some(expected), Some(found)) = (target_ty, found)
            && !expected.accepts(&found)
        {
            self.errors
                .push(EngineError::mismatch(&target.name, expected, found));
        }
    }

    fn check_call_stmt(&mut self, outputs: &[Target], procedure: &str, args: &[Arg]) {
        let program = self.program;
        let Some(callee) = program.procedure(procedure) else {
            self.errors
                .push(EngineError::invalid(format!("unknown procedure `{procedure}`")));
            return;
        };
        if outputs.len() != callee.outputs.len() {
            self.errors.push(EngineError::invalid(format!(
                "`{procedure}` has {} outputs but the call binds {}",
                callee.outputs.len(),
                outputs.len()
            )));
        }
        let before = self.errors.len();
        for arg in args {
            let mut reads = Vec::new();
            arg.value.reads(&mut reads);
            for name in reads {
                self.require_produced(&name);
            }
        }
        if let Err(err) = check_call_args(callee, args, &*self)
            && self.errors.len() == before
        {
            self.errors.push(err);
        }
        for (target, param) in outputs.iter().zip(&callee.outputs) {
            if let Some(expected) = self.check_target(target)
                && !expected.accepts(&param.ty)
            {
                self.errors
                    .push(EngineError::mismatch(&target.name, expected, &param.ty));
            }
        }
    }
}

/// True if evaluating the expression needs a task of its own.
fn materializes(expr: &Expr) -> bool {
    match expr {
        Expr::WriteData(_) | Expr::ReadData(_) => true,
        Expr::Array(items) | Expr::Strcat(items) => items.iter().any(materializes),
        Expr::Index { array: a, index: b }
        | Expr::Strsplit { text: a, pattern: b }
        | Expr::Join {
            array: a,
            separator: b,
        }
        | Expr::Eq(a, b)
        | Expr::Ne(a, b)
        | Expr::And(a, b)
        | Expr::Or(a, b) => materializes(a) || materializes(b),
        Expr::Regexp {
            text,
            pattern,
            replacement,
        } => materializes(text) || materializes(pattern) || materializes(replacement),
        Expr::Not(inner) => materializes(inner),
        Expr::Call { .. } => true,
        Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Var(_) | Expr::Filename(_) => false,
    }
}

/// Variable named by a stdin/stdout binding.
pub fn stream_name(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Filename(name) | Expr::Var(name) => Some(name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::program::Mapping;

    fn program(main: Vec<Stmt>) -> Program {
        Program {
            types: vec!["tsv".to_string(), "textfile".to_string()],
            params: Vec::new(),
            procedures: Vec::new(),
            main,
        }
    }

    fn app(name: &str, inputs: &[(&str, &str)], outputs: &[(&str, &str)]) -> Procedure {
        Procedure {
            name: name.to_string(),
            outputs: outputs.iter().map(|(n, t)| Param::new(n, t)).collect(),
            inputs: inputs.iter().map(|(n, t)| Param::new(n, t)).collect(),
            body: ProcBody::App(AppTemplate {
                executable: "tool".to_string(),
                arguments: inputs.iter().map(|(n, _)| Expr::var(n)).collect(),
                stdin: None,
                stdout: outputs.first().map(|(n, _)| Expr::Filename(n.to_string())),
                resource: Some("1g".to_string()),
                timeout_secs: None,
            }),
        }
    }

    fn first_error(program: &Program) -> EngineError {
        analyze(program).into_iter().next().expect("expected a diagnostic")
    }

    #[test]
    fn accepts_out_of_order_producers() {
        let program = program(vec![
            Stmt::define("b", "string", Expr::strcat(vec![Expr::var("a"), Expr::str("!")])),
            Stmt::define("a", "string", Expr::str("hello")),
        ]);
        assert!(analyze(&program).is_empty());
    }

    #[test]
    fn undeclared_read_is_a_dependency_error() {
        let program = program(vec![Stmt::define("b", "string", Expr::var("missing"))]);
        assert!(matches!(first_error(&program), EngineError::Dependency(msg) if msg.contains("missing")));
    }

    #[test]
    fn declared_but_never_assigned_is_a_dependency_error() {
        let program = program(vec![
            Stmt::declare("a", "string"),
            Stmt::Trace {
                args: vec![Expr::var("a")],
            },
        ]);
        assert!(matches!(first_error(&program), EngineError::Dependency(msg) if msg.contains("never assigned")));
    }

    #[test]
    fn variable_from_untaken_branch_cannot_be_read_outside() {
        let program = program(vec![
            Stmt::declare("stats", "string"),
            Stmt::If {
                cond: Expr::Bool(false),
                then: vec![Stmt::assign("stats", Expr::str("x"))],
                otherwise: Vec::new(),
            },
            Stmt::Trace {
                args: vec![Expr::var("stats")],
            },
        ]);
        assert!(matches!(
            first_error(&program),
            EngineError::Dependency(msg) if msg.contains("conditional branch")
        ));
    }

    #[test]
    fn branch_local_reads_and_two_sided_assignments_are_fine() {
        let program = program(vec![
            Stmt::declare("x", "string"),
            Stmt::declare("y", "string"),
            Stmt::If {
                cond: Expr::Bool(true),
                then: vec![
                    Stmt::assign("x", Expr::str("a")),
                    Stmt::assign("y", Expr::str("b")),
                    Stmt::Trace {
                        args: vec![Expr::var("y")],
                    },
                ],
                otherwise: vec![Stmt::assign("x", Expr::str("c"))],
            },
            Stmt::Trace {
                args: vec![Expr::var("x")],
            },
        ]);
        assert_eq!(analyze(&program).len(), 0);
    }

    #[test]
    fn assigning_outer_scalar_inside_foreach_is_rejected() {
        let program = program(vec![
            Stmt::declare("shared", "string"),
            Stmt::Foreach {
                var: "item".to_string(),
                index: None,
                over: Expr::Array(vec![Expr::str("a"), Expr::str("b")]),
                body: vec![Stmt::assign("shared", Expr::var("item"))],
            },
        ]);
        assert!(matches!(
            first_error(&program),
            EngineError::DoubleAssignment { variable } if variable == "shared"
        ));
    }

    #[test]
    fn element_writes_from_foreach_produce_the_array() {
        let program = program(vec![
            Stmt::declare("paths", "string[]"),
            Stmt::Foreach {
                var: "entry".to_string(),
                index: Some("i".to_string()),
                over: Expr::Array(vec![Expr::str("a"), Expr::str("b")]),
                body: vec![Stmt::Assign {
                    target: Target::element("paths", Expr::var("i")),
                    value: Expr::strcat(vec![Expr::str("/data/"), Expr::var("entry")]),
                }],
            },
            Stmt::Trace {
                args: vec![Expr::Join {
                    array: Box::new(Expr::var("paths")),
                    separator: Box::new(Expr::str(" ")),
                }],
            },
        ]);
        assert_eq!(analyze(&program).len(), 0);
    }

    #[test]
    fn second_assignment_is_rejected() {
        let program = program(vec![
            Stmt::define("a", "string", Expr::str("1")),
            Stmt::assign("a", Expr::str("2")),
        ]);
        assert!(matches!(first_error(&program), EngineError::DoubleAssignment { .. }));
    }

    #[test]
    fn cycle_between_assignments_is_detected() {
        let program = program(vec![
            Stmt::define("a", "string", Expr::var("b")),
            Stmt::define("b", "string", Expr::var("a")),
        ]);
        assert!(matches!(first_error(&program), EngineError::Dependency(msg) if msg.contains("cyclic")));
    }

    #[test]
    fn index_must_be_int() {
        let program = program(vec![
            Stmt::define(
                "parts",
                "string[]",
                Expr::Strsplit {
                    text: Box::new(Expr::str("a b")),
                    pattern: Box::new(Expr::str(" ")),
                },
            ),
            Stmt::define(
                "first",
                "string",
                Expr::Index {
                    array: Box::new(Expr::var("parts")),
                    index: Box::new(Expr::str("0")),
                },
            ),
        ]);
        assert!(matches!(first_error(&program), EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn call_arguments_are_bound_and_type_checked() {
        let mut program = program(vec![
            Stmt::declare("out", "tsv"),
            Stmt::Call {
                outputs: vec![Target::var("out")],
                procedure: "count".to_string(),
                args: vec![Arg::named("flag", Expr::Int(3))],
            },
        ]);
        program.procedures.push(app("count", &[("flag", "string")], &[("stats", "tsv")]));
        assert!(matches!(first_error(&program), EngineError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_procedure_and_arity_are_reported() {
        let program = program(vec![Stmt::Call {
            outputs: Vec::new(),
            procedure: "nope".to_string(),
            args: Vec::new(),
        }]);
        assert!(matches!(first_error(&program), EngineError::InvalidProgram(msg) if msg.contains("nope")));
    }

    #[test]
    fn recursive_procedures_are_rejected() {
        let mut program = program(Vec::new());
        program.procedures.push(Procedure {
            name: "loop".to_string(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            body: ProcBody::Compound(vec![Stmt::Call {
                outputs: Vec::new(),
                procedure: "loop".to_string(),
                args: Vec::new(),
            }]),
        });
        assert!(matches!(first_error(&program), EngineError::InvalidProgram(msg) if msg.contains("recursive")));
    }

    #[test]
    fn compound_output_must_be_assigned() {
        let mut program = program(Vec::new());
        program.procedures.push(Procedure {
            name: "call_de".to_string(),
            outputs: vec![Param::new("t", "tsv")],
            inputs: Vec::new(),
            body: ProcBody::Compound(vec![Stmt::mapped(
                "stats",
                "tsv",
                Mapping::Concurrent {
                    prefix: Expr::str("stats"),
                    suffix: Expr::str(".tsv"),
                },
            )]),
        });
        assert!(matches!(first_error(&program), EngineError::Dependency(msg) if msg.contains("`t`")));
    }

    #[test]
    fn app_stdout_must_be_an_output() {
        let mut program = program(Vec::new());
        let mut tr = app("tr", &[("text", "textfile")], &[("result", "textfile")]);
        if let ProcBody::App(template) = &mut tr.body {
            template.stdout = Some(Expr::Filename("text".to_string()));
        }
        program.procedures.push(tr);
        assert!(matches!(first_error(&program), EngineError::InvalidProgram(msg) if msg.contains("stdout")));
    }

    #[test]
    fn mapping_on_string_is_rejected() {
        let program = program(vec![Stmt::mapped(
            "s",
            "string",
            Mapping::Fixed {
                name: Expr::str("out.txt"),
            },
        )]);
        assert!(matches!(first_error(&program), EngineError::InvalidProgram(msg) if msg.contains("file mapping")));
    }
}
