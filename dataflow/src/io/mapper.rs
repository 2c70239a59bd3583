//! Deterministic, collision-free backing paths for file variables.
//!
//! Paths are leased to the variable that maps them for as long as the
//! variable's scope is open. A second live variable asking for a leased path
//! is a `MappingCollision`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::engine::scope::ScopeId;
use crate::error::EngineError;

/// Mapping policy with its parameters already evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapRequest {
    /// `work_dir/name`; a stale file is removed before the producer runs.
    Fixed { name: String },
    /// `run_dir/name`; one path for the whole run.
    SinglePerRun { name: String },
    /// `run_dir/prefix-NNNNNN suffix`, unique per call.
    Concurrent { prefix: String, suffix: String },
    /// Unmapped file variable: `run_dir/_anon/name-NNNNNN.type`.
    Anonymous { name: String, file_type: String },
}

#[derive(Debug)]
struct Lease {
    owner: String,
    scope: ScopeId,
}

#[derive(Debug)]
pub struct FileMapper {
    work_dir: PathBuf,
    run_dir: PathBuf,
    counter: AtomicU64,
    live: Mutex<HashMap<PathBuf, Lease>>,
    fixed: Mutex<HashSet<PathBuf>>,
}

impl FileMapper {
    pub fn new(work_dir: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            run_dir: run_dir.into(),
            counter: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
            fixed: Mutex::new(HashSet::new()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn next_serial(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Compute the path for a request without leasing it.
    pub fn path_for(&self, request: &MapRequest) -> PathBuf {
        match request {
            MapRequest::Fixed { name } => self.work_dir.join(name),
            MapRequest::SinglePerRun { name } => self.run_dir.join(name),
            MapRequest::Concurrent { prefix, suffix } => self
                .run_dir
                .join(format!("{prefix}-{:06}{suffix}", self.next_serial())),
            MapRequest::Anonymous { name, file_type } => self.run_dir.join("_anon").join(format!(
                "{}-{:06}.{}",
                sanitize(name),
                self.next_serial(),
                sanitize(file_type)
            )),
        }
    }

    /// Compute a path and lease it to `owner` until `scope` closes.
    pub fn assign(
        &self,
        request: &MapRequest,
        owner: &str,
        scope: ScopeId,
    ) -> Result<PathBuf, EngineError> {
        let path = self.path_for(request);
        let mut live = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lease) = live.get(&path)
            && lease.owner != owner
        {
            return Err(EngineError::MappingCollision {
                path,
                owner: lease.owner.clone(),
            });
        }
        live.insert(
            path.clone(),
            Lease {
                owner: owner.to_string(),
                scope,
            },
        );
        drop(live);

        if matches!(request, MapRequest::Fixed { .. }) {
            self.fixed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(path.clone());
        }
        debug!(owner, path = %path.display(), "mapped file");
        Ok(path)
    }

    /// Drop every lease held by variables of a closed scope.
    pub fn release_scope(&self, scope: ScopeId) {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|_, lease| lease.scope != scope);
    }

    /// Get an output path ready for its producer: create the parent
    /// directory and remove a stale file left at a fixed path.
    pub fn prepare_output(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| EngineError::io(format!("create {}", parent.display()), &err))?;
        }
        let is_fixed = self
            .fixed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(path);
        if is_fixed && path.exists() {
            warn!(path = %path.display(), "removing stale output");
            fs::remove_file(path)
                .map_err(|err| EngineError::io(format!("remove {}", path.display()), &err))?;
        }
        Ok(())
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
