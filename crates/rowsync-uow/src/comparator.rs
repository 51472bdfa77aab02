//! Type-aware snapshot comparison.
//!
//! The comparator diffs two snapshot records and reports the changed
//! paths. Comparison is semantic rather than bitwise: integer widths
//! are normalized, NaN equals NaN so a float column does not show up
//! dirty forever, and individual columns can override comparison with
//! a registered equality hook.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rowsync_core::Value;

use crate::snapshot::{SnapshotPlan, SnapshotRecord};

/// A custom equality predicate for one column.
pub type EqualityHook = Box<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// One changed path in a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Column name or dotted composite path
    pub path: String,
    pub old: Value,
    pub new: Value,
}

/// Compares snapshot records.
///
/// Cloning shares the hook registry, so forked contexts see hooks
/// registered on the parent.
#[derive(Clone, Default)]
pub struct Comparator {
    hooks: Arc<RwLock<HashMap<&'static str, EqualityHook>>>,
}

impl Comparator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an equality hook under a name. Fields opt in via
    /// `FieldMeta::equality_hook(name)`.
    pub fn register_hook<F>(&self, name: &'static str, hook: F)
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .expect("equality hook registry poisoned")
            .insert(name, Box::new(hook));
    }

    /// Compare two values, consulting the named hook when given.
    pub fn values_equal(&self, hook: Option<&str>, old: &Value, new: &Value) -> bool {
        if let Some(name) = hook {
            let hooks = self.hooks.read().expect("equality hook registry poisoned");
            if let Some(f) = hooks.get(name) {
                return f(old, new);
            }
        }
        semantic_eq(old, new)
    }

    /// Diff two snapshot records against a plan.
    ///
    /// The result is ordered by path, so repeated diffs of the same
    /// state produce identical output. When either record is partial
    /// (a column the plan lists is absent, meaning it was never
    /// loaded), comparison is restricted to columns both records
    /// cover; an unloaded column is never diffed against a loaded
    /// value. Within a covered composite, an absent path reads as
    /// NULL so removed object fields still show up.
    pub fn diff(
        &self,
        plan: &SnapshotPlan,
        old: &SnapshotRecord,
        new: &SnapshotRecord,
    ) -> Vec<FieldChange> {
        let restrict = plan.is_partial(old) || plan.is_partial(new);
        let covered: HashSet<&'static str> = if restrict {
            plan.loaded_roots(old)
                .intersection(&plan.loaded_roots(new))
                .copied()
                .collect()
        } else {
            HashSet::new()
        };
        let paths: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        let mut changes = Vec::new();
        for path in paths {
            if restrict
                && !plan
                    .root_column(path)
                    .is_some_and(|root| covered.contains(root))
            {
                continue;
            }
            let old_value = old.get(path.as_str()).unwrap_or(&Value::Null);
            let new_value = new.get(path.as_str()).unwrap_or(&Value::Null);
            let hook = plan.hook_for(path);
            if !self.values_equal(hook, old_value, new_value) {
                changes.push(FieldChange {
                    path: path.clone(),
                    old: old_value.clone(),
                    new: new_value.clone(),
                });
            }
        }
        changes
    }
}

impl std::fmt::Debug for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .hooks
            .read()
            .map(|h| h.len())
            .unwrap_or_default();
        f.debug_struct("Comparator").field("hooks", &count).finish()
    }
}

/// Default value equality.
///
/// Integer variants compare by widened value, floats compare by bits
/// (NaN == NaN), everything else falls back to `PartialEq`.
pub fn semantic_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (int_of(a), int_of(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
        (Value::Float(x), Value::Double(y)) | (Value::Double(y), Value::Float(x)) => {
            f64::from(*x).to_bits() == y.to_bits()
        }
        _ => a == b,
    }
}

fn int_of(v: &Value) -> Option<i64> {
    match v {
        Value::TinyInt(x) => Some(i64::from(*x)),
        Value::SmallInt(x) => Some(i64::from(*x)),
        Value::Int(x) => Some(i64::from(*x)),
        Value::BigInt(x) => Some(*x),
        _ => None,
    }
}
