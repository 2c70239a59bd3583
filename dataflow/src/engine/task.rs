//! Units of scheduled work.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::expr::PureOp;
use crate::core::program::Stmt;
use crate::core::value::{Operand, VarId, VarType};
use crate::engine::scope::Scope;

/// Submission-order id; the scheduler dispatches lower ids first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// External invocation with argument tokens still unresolved.
///
/// `argv` tokens are rendered just before launch: literals as-is, variable
/// operands as their value (arrays expand to one argument per element) and
/// `PathOf` operands as the variable's backing path.
#[derive(Debug, Clone)]
pub struct AppCall {
    pub procedure: String,
    pub executable: String,
    pub argv: Vec<Operand>,
    pub stdin: Option<Operand>,
    pub stdout: Option<VarId>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    /// Pure function over resolved operands; one output.
    Eval { op: PureOp, args: Vec<Operand> },
    App(AppCall),
    /// Write a string to the output file.
    WriteData { text: Operand },
    /// Read a file into the output string.
    ReadData { file: Operand },
    /// Copy a file into the output's mapped path.
    Copy { source: Operand },
    Trace { args: Vec<Operand> },
    /// Unroll a loop body once the array settles.
    Foreach {
        var: String,
        index: Option<String>,
        element: VarType,
        over: Operand,
        body: Vec<Stmt>,
    },
    /// Instantiate one branch once the condition settles.
    Guard {
        cond: Operand,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
}

impl TaskKind {
    pub fn is_deferred(&self) -> bool {
        matches!(self, TaskKind::Foreach { .. } | TaskKind::Guard { .. })
    }
}

/// Outer variables a deferred construct may assign.
#[derive(Debug, Clone, Default)]
pub struct Exports {
    /// Failed if the construct fails before its body can assign them.
    pub scalars: Vec<VarId>,
    /// Element-wise arrays the construct holds a writer token on.
    pub arrays: Vec<VarId>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub scope: Arc<Scope>,
    pub kind: TaskKind,
    /// Distinct variables that must settle before the task is ready.
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    pub exports: Exports,
    /// Advisory memory weight in megabytes; 0 is unweighted.
    pub weight_mb: u64,
}

impl Task {
    pub fn new(label: impl Into<String>, scope: Arc<Scope>, kind: TaskKind) -> Self {
        Self {
            id: TaskId(0),
            label: label.into(),
            scope,
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            exports: Exports::default(),
            weight_mb: 0,
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = VarId>) -> Self {
        for input in inputs {
            if !self.inputs.contains(&input) {
                self.inputs.push(input);
            }
        }
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<VarId>) -> Self {
        self.outputs = outputs;
        self
    }
}
