//! Variable types, runtime values and task operands.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Declared type of a dataflow variable.
///
/// Serialized as a type name: `string`, `int`, `boolean`, a declared file
/// type such as `tsv`, or any of these followed by `[]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VarType {
    String,
    Int,
    Boolean,
    /// A file reference of a declared file type. The empty name matches any
    /// file type and is only produced by inference (e.g. `write_data`).
    File(String),
    Array(Box<VarType>),
}

impl VarType {
    pub fn is_file(&self) -> bool {
        matches!(self, VarType::File(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, VarType::Array(_))
    }

    pub fn element(&self) -> Option<&VarType> {
        match self {
            VarType::Array(inner) => Some(inner),
            _ => None,
        }
    }

    /// True if a value of type `from` may be stored in a variable of this type.
    pub fn accepts(&self, from: &VarType) -> bool {
        match (self, from) {
            (VarType::File(_), VarType::File(name)) if name.is_empty() => true,
            (VarType::File(to), VarType::File(from)) => to.is_empty() || to == from,
            (VarType::Array(to), VarType::Array(from)) => to.accepts(from),
            _ => self == from,
        }
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarType::String => f.write_str("string"),
            VarType::Int => f.write_str("int"),
            VarType::Boolean => f.write_str("boolean"),
            VarType::File(name) if name.is_empty() => f.write_str("file"),
            VarType::File(name) => f.write_str(name),
            VarType::Array(inner) => write!(f, "{inner}[]"),
        }
    }
}

impl FromStr for VarType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_suffix("[]") {
            return Ok(VarType::Array(Box::new(inner.parse()?)));
        }
        match raw {
            "string" => Ok(VarType::String),
            "int" => Ok(VarType::Int),
            "boolean" => Ok(VarType::Boolean),
            name if is_identifier(name) => Ok(VarType::File(name.to_string())),
            other => Err(format!("invalid type name `{other}`")),
        }
    }
}

impl TryFrom<String> for VarType {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<VarType> for String {
    fn from(ty: VarType) -> Self {
        ty.to_string()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolved value of a variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    File(PathBuf),
    Array(Vec<Value>),
}

impl Value {
    pub fn str(value: impl Into<String>) -> Self {
        Value::Str(value.into())
    }

    pub fn conforms_to(&self, ty: &VarType) -> bool {
        match (self, ty) {
            (Value::Str(_), VarType::String)
            | (Value::Int(_), VarType::Int)
            | (Value::Bool(_), VarType::Boolean)
            | (Value::File(_), VarType::File(_)) => true,
            (Value::Array(items), VarType::Array(inner)) => {
                items.iter().all(|item| item.conforms_to(inner))
            }
            _ => false,
        }
    }

    /// Name of the value's shape, used in type mismatch messages.
    pub fn shape(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "int",
            Value::Bool(_) => "boolean",
            Value::File(_) => "file",
            Value::Array(_) => "array",
        }
    }

    /// Text form used for arguments, concatenation and traces.
    pub fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::File(path) => path.display().to_string(),
            Value::Array(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Parse a raw command-line or default value as the given type.
    pub fn parse_as(ty: &VarType, raw: &str) -> Result<Value, EngineError> {
        match ty {
            VarType::String => Ok(Value::Str(raw.to_string())),
            VarType::Int => raw
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| EngineError::mismatch(raw, ty, "non-numeric text")),
            VarType::Boolean => match raw.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(EngineError::mismatch(raw, ty, "text")),
            },
            VarType::File(_) => Ok(Value::File(PathBuf::from(raw))),
            VarType::Array(inner) => raw
                .split(',')
                .filter(|piece| !piece.is_empty())
                .map(|piece| Value::parse_as(inner, piece))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

/// Identifier of a variable in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Argument of a task, resolved just before the task body runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Value known when the graph was built.
    Lit(Value),
    /// Value of a variable; the variable is a task input.
    Var(VarId),
    /// Backing path of a file variable. Only the mapping parameters are
    /// inputs, so the file itself need not exist yet.
    PathOf(VarId),
}

impl Operand {
    pub fn literal(&self) -> Option<&Value> {
        match self {
            Operand::Lit(value) => Some(value),
            _ => None,
        }
    }
}
