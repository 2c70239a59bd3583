//! Pure string and array functions evaluated over resolved values.
//!
//! Nothing here blocks or touches the filesystem. The builder folds these at
//! graph construction time when every argument is already known; otherwise
//! they run as `Eval` tasks once their inputs settle.

use regex::Regex;

use crate::core::value::Value;
use crate::error::EngineError;

/// Pure operation carried by an evaluation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PureOp {
    Identity,
    MakeArray,
    Strcat,
    Regexp,
    Strsplit,
    Join,
    Index,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

impl PureOp {
    pub fn name(self) -> &'static str {
        match self {
            PureOp::Identity => "identity",
            PureOp::MakeArray => "array",
            PureOp::Strcat => "strcat",
            PureOp::Regexp => "regexp",
            PureOp::Strsplit => "strsplit",
            PureOp::Join => "join",
            PureOp::Index => "index",
            PureOp::Eq => "eq",
            PureOp::Ne => "ne",
            PureOp::And => "and",
            PureOp::Or => "or",
            PureOp::Not => "not",
        }
    }
}

pub fn evaluate(op: PureOp, args: &[Value]) -> Result<Value, EngineError> {
    match (op, args) {
        (PureOp::Identity, [value]) => Ok(value.clone()),
        (PureOp::MakeArray, items) => Ok(Value::Array(items.to_vec())),
        (PureOp::Strcat, parts) => Ok(Value::Str(strcat(parts))),
        (PureOp::Regexp, [text, pattern, replacement]) => regexp(
            &text.render(),
            &pattern.render(),
            &replacement.render(),
        )
        .map(Value::Str),
        (PureOp::Strsplit, [text, pattern]) => strsplit(&text.render(), &pattern.render())
            .map(|pieces| Value::Array(pieces.into_iter().map(Value::Str).collect())),
        (PureOp::Join, [Value::Array(items), separator]) => {
            Ok(Value::Str(join(items, &separator.render())))
        }
        (PureOp::Index, [Value::Array(items), Value::Int(index)]) => index_array(items, *index),
        (PureOp::Eq, [a, b]) => Ok(Value::Bool(a == b)),
        (PureOp::Ne, [a, b]) => Ok(Value::Bool(a != b)),
        (PureOp::And, [Value::Bool(a), Value::Bool(b)]) => Ok(Value::Bool(*a && *b)),
        (PureOp::Or, [Value::Bool(a), Value::Bool(b)]) => Ok(Value::Bool(*a || *b)),
        (PureOp::Not, [Value::Bool(a)]) => Ok(Value::Bool(!*a)),
        (op, args) => Err(EngineError::Expression(format!(
            "`{}` cannot be applied to ({})",
            op.name(),
            args.iter().map(Value::shape).collect::<Vec<_>>().join(", ")
        ))),
    }
}

/// Concatenate the text form of every part.
pub fn strcat(parts: &[Value]) -> String {
    parts.iter().map(Value::render).collect()
}

/// Replace every match of `pattern` in `text`.
pub fn regexp(text: &str, pattern: &str, replacement: &str) -> Result<String, EngineError> {
    let re = compile(pattern)?;
    Ok(re.replace_all(text, replacement).into_owned())
}

/// Split `text` on every match of `pattern`, dropping trailing empty pieces.
pub fn strsplit(text: &str, pattern: &str) -> Result<Vec<String>, EngineError> {
    let re = compile(pattern)?;
    let mut pieces: Vec<String> = re.split(text).map(str::to_string).collect();
    while pieces.last().is_some_and(String::is_empty) {
        pieces.pop();
    }
    Ok(pieces)
}

pub fn join(items: &[Value], separator: &str) -> String {
    items
        .iter()
        .map(Value::render)
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn index_array(items: &[Value], index: i64) -> Result<Value, EngineError> {
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| {
            EngineError::Expression(format!(
                "index {index} out of range for array of length {}",
                items.len()
            ))
        })
}

fn compile(pattern: &str) -> Result<Regex, EngineError> {
    Regex::new(pattern)
        .map_err(|err| EngineError::Expression(format!("invalid regex `{pattern}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regexp_replaces_every_match() {
        let out = regexp("AAABBBCCC", "B", "Z").expect("regexp");
        assert_eq!(out, "AAAZZZCCC");
    }

    #[test]
    fn split_then_rejoin_basename_lists() {
        let group1 = strsplit("basename1,basename2", ",").expect("split");
        let group2 = strsplit("basename3,basename4", ",").expect("split");
        let all: Vec<Value> = group1.into_iter().chain(group2).map(Value::Str).collect();
        assert_eq!(join(&all, " "), "basename1 basename2 basename3 basename4");
    }

    #[test]
    fn replace_commas_then_concatenate() {
        let a = regexp("basename1,basename2", "[,]", " ").expect("regexp");
        let b = regexp("basename3,basename4", "[,]", " ").expect("regexp");
        let all = strcat(&[Value::Str(a), Value::str(" "), Value::Str(b)]);
        assert_eq!(all, "basename1 basename2 basename3 basename4");
    }

    #[test]
    fn strsplit_drops_trailing_empty_pieces_only() {
        let pieces = strsplit(",a,,b,,", ",").expect("split");
        assert_eq!(pieces, vec!["", "a", "", "b"]);
    }

    #[test]
    fn invalid_pattern_is_an_expression_error() {
        let err = regexp("x", "(", "y").unwrap_err();
        assert!(matches!(err, EngineError::Expression(_)));
    }

    #[test]
    fn index_out_of_range_is_an_error() {
        let items = vec![Value::str("a")];
        assert_eq!(index_array(&items, 0).expect("index"), Value::str("a"));
        assert!(index_array(&items, 1).is_err());
        assert!(index_array(&items, -1).is_err());
    }

    #[test]
    fn evaluate_rejects_mismatched_shapes() {
        let err = evaluate(PureOp::Not, &[Value::str("true")]).unwrap_err();
        assert!(err.to_string().contains("`not` cannot be applied to (string)"));
    }

    #[test]
    fn guard_condition_evaluates() {
        let adjust = Value::str("true");
        let weights = Value::str("false");
        let is_true = evaluate(PureOp::Eq, &[adjust, Value::str("true")]).expect("eq");
        let not_gc = evaluate(PureOp::Ne, &[weights, Value::str("gc")]).expect("ne");
        let both = evaluate(PureOp::And, &[is_true, not_gc]).expect("and");
        assert_eq!(evaluate(PureOp::Not, &[both]).expect("not"), Value::Bool(false));
    }
}
