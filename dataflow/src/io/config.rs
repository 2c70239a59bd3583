//! Engine configuration stored in `dataflow.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::resource::parse_memory_mb;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "dataflow.toml";

/// Engine configuration (TOML).
///
/// Missing fields take their defaults; command-line flags override the file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads draining ready tasks.
    pub parallelism: usize,

    /// Advisory memory budget shared by tasks with a resource hint (`"8g"`).
    pub memory_budget: String,

    /// Per-task wall-clock limit in seconds; 0 disables it. An app's own
    /// `timeout_secs` takes precedence.
    pub task_timeout_secs: u64,

    /// Cancel the whole run on the first task that fails by itself.
    pub fail_fast: bool,

    /// Working directory of child processes and root of `fixed` mappings.
    pub work_dir: PathBuf,

    /// Directory under `work_dir` holding per-run files.
    pub state_dir: String,

    /// Truncate captured stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// How often running processes check for cancellation.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            memory_budget: "8g".to_string(),
            task_timeout_secs: 0,
            fail_fast: true,
            work_dir: PathBuf::from("."),
            state_dir: "_dataflow".to_string(),
            output_limit_bytes: 64_000,
            poll_interval_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(anyhow!("parallelism must be > 0"));
        }
        parse_memory_mb(&self.memory_budget)
            .map_err(|err| anyhow!("memory_budget: {err}"))?;
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.state_dir.trim().is_empty() {
            return Err(anyhow!("state_dir must not be empty"));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_secs > 0).then(|| Duration::from_secs(self.task_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert!(cfg.fail_fast);
        assert_eq!(cfg.task_timeout(), None);
    }

    #[test]
    fn full_file_overrides_every_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("dataflow.toml");
        fs::write(
            &path,
            r#"parallelism = 2
memory_budget = "12g"
task_timeout_secs = 90
fail_fast = false
work_dir = "/srv/pipelines"
state_dir = ".runs"
output_limit_bytes = 4096
poll_interval_ms = 5
"#,
        )
        .expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(
            loaded,
            EngineConfig {
                parallelism: 2,
                memory_budget: "12g".to_string(),
                task_timeout_secs: 90,
                fail_fast: false,
                work_dir: PathBuf::from("/srv/pipelines"),
                state_dir: ".runs".to_string(),
                output_limit_bytes: 4096,
                poll_interval_ms: 5,
            }
        );
        assert_eq!(loaded.task_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(loaded.poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn mistyped_field_fails_to_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("dataflow.toml");
        fs::write(&path, "parallelism = \"many\"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse"), "{err:#}");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("dataflow.toml");
        fs::write(&path, "parallelism = 3\nfail_fast = false\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.parallelism, 3);
        assert!(!cfg.fail_fast);
        assert_eq!(cfg.memory_budget, "8g");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("dataflow.toml");
        fs::write(&path, "memory_budget = \"plenty\"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("memory_budget"));

        fs::write(&path, "memory_budget = \"20000000000t\"\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("memory_budget"), "{err:#}");

        let cfg = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
