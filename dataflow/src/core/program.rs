//! Program data model: procedures, statements and expressions.
//!
//! A [`Program`] is plain data. It can be built in Rust with the helper
//! constructors below or deserialized from a JSON pipeline document
//! (see [`crate::io::pipeline`]).

use serde::{Deserialize, Serialize};

use crate::core::value::VarType;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    /// Declared file type names (e.g. `tsv`, `textfile`).
    #[serde(default)]
    pub types: Vec<String>,
    /// Named top-level inputs, supplied on the command line.
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub procedures: Vec<Procedure>,
    pub main: Vec<Stmt>,
}

impl Program {
    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.name == name)
    }
}

/// Procedure parameter or top-level program input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: VarType,
    /// Literal used when the caller does not bind the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Expr>,
}

impl Param {
    pub fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.parse().unwrap_or(VarType::String),
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub outputs: Vec<Param>,
    #[serde(default)]
    pub inputs: Vec<Param>,
    pub body: ProcBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcBody {
    /// Invocation of an external executable.
    App(AppTemplate),
    /// Body inlined into the caller's graph under a private scope.
    Compound(Vec<Stmt>),
}

/// Command template of an app procedure.
///
/// Arguments are expressions over the procedure's parameters. Literal strings
/// become flags; file parameters render as their paths; arrays expand to one
/// argument per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppTemplate {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Expr>,
    /// Advisory memory weight such as `"3g"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// File mapping directive attached to a declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mapping {
    Fixed { name: Expr },
    SinglePerRun { name: Expr },
    Concurrent { prefix: Expr, suffix: Expr },
}

impl Mapping {
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Mapping::Fixed { name } | Mapping::SinglePerRun { name } => vec![name],
            Mapping::Concurrent { prefix, suffix } => vec![prefix, suffix],
        }
    }
}

/// Assignment target: a variable or one element of an array variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Expr>,
}

impl Target {
    pub fn var(name: &str) -> Self {
        Self {
            name: name.to_string(),
            index: None,
        }
    }

    pub fn element(name: &str, index: Expr) -> Self {
        Self {
            name: name.to_string(),
            index: Some(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stmt {
    Declare {
        name: String,
        #[serde(rename = "type")]
        ty: VarType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mapping: Option<Mapping>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<Expr>,
    },
    Assign {
        target: Target,
        value: Expr,
    },
    /// Call with any number of outputs, bound in order.
    Call {
        #[serde(default)]
        outputs: Vec<Target>,
        procedure: String,
        #[serde(default)]
        args: Vec<Arg>,
    },
    Foreach {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        over: Expr,
        body: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Stmt>,
    },
    Trace {
        args: Vec<Expr>,
    },
}

impl Stmt {
    pub fn declare(name: &str, ty: &str) -> Self {
        Stmt::Declare {
            name: name.to_string(),
            ty: ty.parse().unwrap_or(VarType::String),
            mapping: None,
            init: None,
        }
    }

    pub fn define(name: &str, ty: &str, init: Expr) -> Self {
        Stmt::Declare {
            name: name.to_string(),
            ty: ty.parse().unwrap_or(VarType::String),
            mapping: None,
            init: Some(init),
        }
    }

    pub fn mapped(name: &str, ty: &str, mapping: Mapping) -> Self {
        Stmt::Declare {
            name: name.to_string(),
            ty: ty.parse().unwrap_or(VarType::String),
            mapping: Some(mapping),
            init: None,
        }
    }

    pub fn assign(name: &str, value: Expr) -> Self {
        Stmt::Assign {
            target: Target::var(name),
            value,
        }
    }

    /// Name declared by this statement, if any.
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Stmt::Declare { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Call argument; unnamed arguments bind by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Arg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub value: Expr,
}

impl Arg {
    pub fn positional(value: Expr) -> Self {
        Self { name: None, value }
    }

    pub fn named(name: &str, value: Expr) -> Self {
        Self {
            name: Some(name.to_string()),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Str(String),
    Int(i64),
    Bool(bool),
    Var(String),
    Array(Vec<Expr>),
    Index {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    Strcat(Vec<Expr>),
    Regexp {
        text: Box<Expr>,
        pattern: Box<Expr>,
        replacement: Box<Expr>,
    },
    Strsplit {
        text: Box<Expr>,
        pattern: Box<Expr>,
    },
    Join {
        array: Box<Expr>,
        separator: Box<Expr>,
    },
    /// Backing path of a file variable; does not wait for the file.
    Filename(String),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Materialize a string as a file.
    WriteData(Box<Expr>),
    /// Read a file's contents back as a string.
    ReadData(Box<Expr>),
    Call {
        procedure: String,
        #[serde(default)]
        args: Vec<Arg>,
    },
}

impl Expr {
    pub fn str(value: &str) -> Self {
        Expr::Str(value.to_string())
    }

    pub fn var(name: &str) -> Self {
        Expr::Var(name.to_string())
    }

    pub fn strcat(parts: Vec<Expr>) -> Self {
        Expr::Strcat(parts)
    }

    pub fn call(procedure: &str, args: Vec<Arg>) -> Self {
        Expr::Call {
            procedure: procedure.to_string(),
            args,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Str(_) | Expr::Int(_) | Expr::Bool(_))
    }

    /// Names whose values this expression reads.
    ///
    /// `Filename` is not a read: it needs only the mapping, not the file.
    pub fn reads(&self, out: &mut Vec<String>) {
        match self {
            Expr::Str(_) | Expr::Int(_) | Expr::Bool(_) | Expr::Filename(_) => {}
            Expr::Var(name) => out.push(name.clone()),
            Expr::Array(items) | Expr::Strcat(items) => {
                items.iter().for_each(|item| item.reads(out));
            }
            Expr::Index { array, index } => {
                array.reads(out);
                index.reads(out);
            }
            Expr::Regexp {
                text,
                pattern,
                replacement,
            } => {
                text.reads(out);
                pattern.reads(out);
                replacement.reads(out);
            }
            Expr::Strsplit { text, pattern } => {
                text.reads(out);
                pattern.reads(out);
            }
            Expr::Join { array, separator } => {
                array.reads(out);
                separator.reads(out);
            }
            Expr::Eq(a, b) | Expr::Ne(a, b) | Expr::And(a, b) | Expr::Or(a, b) => {
                a.reads(out);
                b.reads(out);
            }
            Expr::Not(inner) | Expr::WriteData(inner) | Expr::ReadData(inner) => inner.reads(out),
            Expr::Call { args, .. } => args.iter().for_each(|arg| arg.value.reads(out)),
        }
    }
}

/// Bind call arguments to a procedure's input parameters.
///
/// An unnamed argument at position `i` binds parameter `i`; a named argument
/// binds the parameter with that name. Every parameter must end up bound
/// exactly once, either by the caller or by its default.
pub fn bind_arguments<'a>(
    procedure: &'a Procedure,
    args: &'a [Arg],
) -> Result<Vec<&'a Expr>, EngineError> {
    let params = &procedure.inputs;
    let mut bound: Vec<Option<&Expr>> = vec![None; params.len()];

    for (position, arg) in args.iter().enumerate() {
        let slot = match &arg.name {
            Some(name) => params
                .iter()
                .position(|param| &param.name == name)
                .ok_or_else(|| {
                    EngineError::invalid(format!(
                        "procedure `{}` has no parameter named `{name}`",
                        procedure.name
                    ))
                })?,
            None if position < params.len() => position,
            None => {
                return Err(EngineError::invalid(format!(
                    "procedure `{}` takes {} arguments, got {}",
                    procedure.name,
                    params.len(),
                    args.len()
                )));
            }
        };
        if bound[slot].is_some() {
            return Err(EngineError::invalid(format!(
                "parameter `{}` of `{}` is bound more than once",
                params[slot].name, procedure.name
            )));
        }
        bound[slot] = Some(&arg.value);
    }

    bound
        .into_iter()
        .zip(params)
        .map(|(value, param)| {
            value.or(param.default.as_ref()).ok_or_else(|| {
                EngineError::invalid(format!(
                    "missing argument `{}` in call to `{}`",
                    param.name, procedure.name
                ))
            })
        })
        .collect()
}
