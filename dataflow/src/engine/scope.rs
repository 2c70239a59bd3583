//! Private binding namespaces with implicit join.
//!
//! A scope counts its outstanding work: one build token held while its body
//! is being instantiated, one per task registered in it and one per open
//! child scope. When the count drops to zero the scope closes and releases
//! its token on the parent. Cancellation is inherited from every ancestor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::value::VarId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

pub struct Scope {
    id: ScopeId,
    label: String,
    parent: Option<Arc<Scope>>,
    bindings: Mutex<HashMap<String, VarId>>,
    outstanding: AtomicUsize,
    cancelled: AtomicBool,
}

impl Scope {
    /// Root scope of a run, holding its build token.
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            id: ScopeId(0),
            label: "main".to_string(),
            parent: None,
            bindings: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
        })
    }

    /// Open a child scope. The child holds a token on `parent` until it
    /// closes, and starts with its own build token.
    pub fn child(parent: &Arc<Scope>, id: ScopeId, label: impl Into<String>) -> Arc<Self> {
        parent.acquire();
        Arc::new(Self {
            id,
            label: label.into(),
            parent: Some(Arc::clone(parent)),
            bindings: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(1),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bind(&self, name: &str, var: VarId) {
        self.bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string(), var);
    }

    /// Resolve a name through the scope chain, innermost first.
    pub fn lookup(&self, name: &str) -> Option<VarId> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            let found = current
                .bindings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(name)
                .copied();
            if found.is_some() {
                return found;
            }
            scope = current.parent.as_deref();
        }
        None
    }

    pub fn acquire(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one unit of outstanding work. Returns every scope that closed as
    /// a result, innermost first.
    pub fn release(&self) -> Vec<ScopeId> {
        let mut closed = Vec::new();
        let mut scope = Some(self);
        while let Some(current) = scope {
            if current.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
                break;
            }
            closed.push(current.id);
            scope = current.parent.as_deref();
        }
        closed
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True if this scope or any ancestor was cancelled.
    pub fn is_cancelled(&self) -> bool {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if current.cancelled.load(Ordering::Acquire) {
                return true;
            }
            scope = current.parent.as_deref();
        }
        false
    }

    /// True if `ancestor` is this scope or one of its parents.
    pub fn is_within(&self, ancestor: ScopeId) -> bool {
        let mut scope = Some(self);
        while let Some(current) = scope {
            if current.id == ancestor {
                return true;
            }
            scope = current.parent.as_deref();
        }
        false
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_the_parent_chain_and_children_shadow() {
        let root = Scope::root();
        root.bind("x", VarId(1));
        root.bind("y", VarId(2));
        let child = Scope::child(&root, ScopeId(1), "foreach[0]");
        child.bind("x", VarId(3));
        assert_eq!(child.lookup("x"), Some(VarId(3)));
        assert_eq!(child.lookup("y"), Some(VarId(2)));
        assert_eq!(root.lookup("x"), Some(VarId(1)));
        assert_eq!(child.lookup("z"), None);
    }

    #[test]
    fn closing_the_last_child_closes_the_parent() {
        let root = Scope::root();
        let child = Scope::child(&root, ScopeId(1), "if");
        child.acquire();
        assert!(root.release().is_empty(), "root still waits for its child");
        assert!(child.release().is_empty(), "child build token released");
        assert_eq!(child.release(), vec![ScopeId(1), ScopeId(0)]);
        assert_eq!(root.outstanding(), 0);
    }

    #[test]
    fn cancellation_is_inherited() {
        let root = Scope::root();
        let child = Scope::child(&root, ScopeId(1), "call");
        let grandchild = Scope::child(&child, ScopeId(2), "foreach[1]");
        assert!(!grandchild.is_cancelled());
        child.cancel();
        assert!(grandchild.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(grandchild.is_within(ScopeId(1)));
        assert!(!root.is_within(ScopeId(2)));
    }
}
