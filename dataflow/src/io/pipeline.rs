//! Pipeline documents: a JSON serialization of [`Program`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::debug;

use crate::core::program::Program;

pub fn parse_pipeline(text: &str) -> Result<Program> {
    serde_json::from_str(text).context("parse pipeline document")
}

pub fn load_pipeline(path: &Path) -> Result<Program> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let program = parse_pipeline(&text).with_context(|| format!("load {}", path.display()))?;
    debug!(
        path = %path.display(),
        procedures = program.procedures.len(),
        statements = program.main.len(),
        "loaded pipeline"
    );
    Ok(program)
}

/// Parse `NAME=VALUE` assignments given on the command line.
pub fn parse_param_assignments(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("parameter `{item}` must have the form NAME=VALUE"))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("parameter `{item}` has an empty name"));
        }
        if params.insert(name.to_string(), value.to_string()).is_some() {
            return Err(anyhow!("parameter `{name}` given more than once"));
        }
    }
    Ok(params)
}
