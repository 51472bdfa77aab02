//! Snapshot plans and records.
//!
//! When an entity becomes managed, a snapshot of its persistable state
//! is taken. Dirty checking later compares a fresh snapshot against the
//! stored one. The shape of a snapshot is computed once per entity type
//! and cached as a [`SnapshotPlan`].

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rowsync_core::{Entity, Row, Value};

/// A flattened snapshot of one entity's persistable state.
///
/// Keys are column names, or dotted paths like `address.city` for
/// embedded composites. `BTreeMap` keeps iteration deterministic, so
/// diffs come out in a stable order.
pub type SnapshotRecord = BTreeMap<String, Value>;

/// One column as seen by the snapshot machinery.
#[derive(Debug, Clone)]
pub struct PlannedColumn {
    pub column: &'static str,
    /// Embedded composite, flattened under dotted paths
    pub composite: bool,
    /// Store-generated; excluded from insert payloads
    pub generated: bool,
    /// Equality hook name overriding comparison for this column
    pub equality_hook: Option<&'static str>,
}

/// Per-type snapshot plan, derived from entity metadata once and
/// shared by every managed instance of the type.
#[derive(Debug, Clone)]
pub struct SnapshotPlan {
    pub table: &'static str,
    pub schema: Option<&'static str>,
    pub columns: Vec<PlannedColumn>,
    pub pk_columns: &'static [&'static str],
    pub version_column: Option<&'static str>,
    /// The single generated primary key column, if the type has one
    pub generated_key: Option<&'static str>,
    /// Foreign key columns as (column, referenced table)
    pub fk_columns: Vec<(&'static str, &'static str)>,
}

impl SnapshotPlan {
    /// Build the plan for an entity type.
    pub fn of<E: Entity>() -> Self {
        let fields = E::fields();
        let columns = fields
            .iter()
            .map(|f| PlannedColumn {
                column: f.column,
                composite: f.composite,
                generated: f.generated,
                equality_hook: f.equality_hook,
            })
            .collect();
        let generated_key = match fields
            .iter()
            .filter(|f| f.primary_key && f.generated)
            .collect::<Vec<_>>()
            .as_slice()
        {
            [only] if E::PRIMARY_KEY.len() == 1 => Some(only.column),
            _ => None,
        };
        let fk_columns = fields
            .iter()
            .filter_map(|f| f.foreign_table().map(|t| (f.column, t)))
            .collect();
        Self {
            table: E::TABLE_NAME,
            schema: E::SCHEMA,
            columns,
            pk_columns: E::PRIMARY_KEY,
            version_column: E::VERSION_COLUMN,
            generated_key,
            fk_columns,
        }
    }

    /// Take a snapshot of a row.
    ///
    /// Composite columns holding JSON objects are flattened recursively
    /// under dotted paths; everything else is stored verbatim. Columns
    /// absent from the row are left out entirely: the record's key set
    /// doubles as the loaded-column set, so a partially fetched row
    /// yields a partial record rather than phantom NULLs.
    pub fn record(&self, row: &Row) -> SnapshotRecord {
        let mut snapshot = SnapshotRecord::new();
        for col in &self.columns {
            let Some(value) = row.get_by_name(col.column).cloned() else {
                continue;
            };
            if col.composite {
                if let Value::Json(serde_json::Value::Object(map)) = &value {
                    flatten_object(col.column, map, &mut snapshot);
                    continue;
                }
            }
            snapshot.insert(col.column.to_string(), value);
        }
        snapshot
    }

    /// The equality hook name for a snapshot path, if any.
    ///
    /// Dotted paths resolve through their root column.
    pub fn hook_for(&self, path: &str) -> Option<&'static str> {
        let root = path.split('.').next().unwrap_or(path);
        self.columns
            .iter()
            .find(|c| c.column == root)
            .and_then(|c| c.equality_hook)
    }

    /// Map a snapshot path back to its root column.
    pub fn root_column(&self, path: &str) -> Option<&'static str> {
        let root = path.split('.').next().unwrap_or(path);
        self.columns
            .iter()
            .find(|c| c.column == root)
            .map(|c| c.column)
    }

    /// Is the column part of the primary key?
    pub fn is_pk_column(&self, column: &str) -> bool {
        self.pk_columns.contains(&column)
    }

    /// Columns a record actually covers, by root column name.
    ///
    /// Flattened composite paths count their root as loaded.
    pub fn loaded_roots(&self, record: &SnapshotRecord) -> HashSet<&'static str> {
        record
            .keys()
            .filter_map(|path| self.root_column(path))
            .collect()
    }

    /// Does the record cover fewer columns than the plan lists?
    pub fn is_partial(&self, record: &SnapshotRecord) -> bool {
        let loaded = self.loaded_roots(record);
        self.columns.iter().any(|c| !loaded.contains(c.column))
    }
}

fn flatten_object(
    prefix: &str,
    map: &serde_json::Map<String, serde_json::Value>,
    out: &mut SnapshotRecord,
) {
    for (field, value) in map {
        let path = format!("{prefix}.{field}");
        match value {
            serde_json::Value::Object(inner) => flatten_object(&path, inner, out),
            serde_json::Value::Null => {
                out.insert(path, Value::Null);
            }
            serde_json::Value::Bool(b) => {
                out.insert(path, Value::Bool(*b));
            }
            serde_json::Value::Number(n) => {
                let v = if let Some(i) = n.as_i64() {
                    Value::BigInt(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                };
                out.insert(path, v);
            }
            serde_json::Value::String(s) => {
                out.insert(path, Value::Text(s.clone()));
            }
            // Arrays stay opaque; element-wise diffing is not useful here.
            serde_json::Value::Array(_) => {
                out.insert(path, Value::Json(value.clone()));
            }
        }
    }
}

/// Cache of snapshot plans keyed by entity type.
///
/// Cloning shares the underlying cache, so a forked context reuses the
/// plans its parent already computed.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPlans {
    plans: Arc<RwLock<HashMap<TypeId, Arc<SnapshotPlan>>>>,
}

impl SnapshotPlans {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached plan for a type, computing it on first use.
    pub fn plan_for<E: Entity>(&self) -> Arc<SnapshotPlan> {
        let type_id = TypeId::of::<E>();
        if let Some(plan) = self
            .plans
            .read()
            .expect("snapshot plan cache poisoned")
            .get(&type_id)
        {
            return Arc::clone(plan);
        }
        let plan = Arc::new(SnapshotPlan::of::<E>());
        self.plans
            .write()
            .expect("snapshot plan cache poisoned")
            .entry(type_id)
            .or_insert_with(|| Arc::clone(&plan))
            .clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.plans.read().expect("snapshot plan cache poisoned").len()
    }
}
