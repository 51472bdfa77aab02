//! Change-set computation.
//!
//! A change set is one planned write: the kind, the target table and
//! the column payload. Updates carry only the columns that actually
//! changed; versioned entities additionally get a version bump and an
//! expected-version condition.

use rowsync_core::Value;

use crate::comparator::Comparator;
use crate::identity_map::{ManagedEntry, ObjectKey};

/// The kind of write a change set represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Insert a new row
    Create,
    /// Update changed columns of an existing row
    Update,
    /// Delete an existing row
    Delete,
    /// Delete executed ahead of creates, so a removed row's unique
    /// values can be re-inserted within the same flush
    DeleteEarly,
}

/// One planned write against the store.
#[derive(Debug)]
pub struct ChangeSet {
    pub key: ObjectKey,
    pub table: &'static str,
    pub kind: ChangeKind,
    /// Columns to write. Empty for deletes, and recomputed at
    /// execution time for creates so foreign keys resolved earlier in
    /// the same flush are picked up.
    pub payload: Vec<(&'static str, Value)>,
    /// Expected version for the WHERE clause of a versioned write
    pub version_check: Option<(&'static str, Value)>,
    /// Foreign key columns withheld from a create that is part of a
    /// dependency cycle; written by a deferred update instead
    pub suppressed_columns: Vec<&'static str>,
    /// Columns a deferred cycle-patch update writes, resolved from the
    /// live entity at execution time
    pub deferred_columns: Vec<&'static str>,
}

impl ChangeSet {
    pub fn is_create(&self) -> bool {
        self.kind == ChangeKind::Create
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ChangeKind::Delete | ChangeKind::DeleteEarly)
    }

    pub fn is_deferred(&self) -> bool {
        !self.deferred_columns.is_empty()
    }
}

/// Builds change sets from managed entries.
pub struct ChangeSetBuilder<'a> {
    comparator: &'a Comparator,
}

impl<'a> ChangeSetBuilder<'a> {
    pub fn new(comparator: &'a Comparator) -> Self {
        Self { comparator }
    }

    /// Insert payload: every non-generated column of the current row.
    ///
    /// A versioned entity whose version is still unset starts at 1.
    pub fn create(&self, entry: &ManagedEntry) -> ChangeSet {
        let row = entry.current_row();
        let mut payload: Vec<(&'static str, Value)> = entry
            .plan
            .columns
            .iter()
            .filter(|c| !c.generated)
            .map(|c| {
                (
                    c.column,
                    row.get_by_name(c.column).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        if let Some(vcol) = entry.plan.version_column {
            if let Some(slot) = payload.iter_mut().find(|(c, _)| *c == vcol) {
                if slot.1.is_null() {
                    slot.1 = Value::BigInt(1);
                }
            }
        }
        ChangeSet {
            key: entry.key,
            table: entry.table,
            kind: ChangeKind::Create,
            payload,
            version_check: None,
            suppressed_columns: Vec::new(),
            deferred_columns: Vec::new(),
        }
    }

    /// Diff the entry against its snapshot and build an update, or
    /// `None` when nothing changed.
    ///
    /// Dotted composite paths fold back to their root column, which is
    /// then written whole. Primary key columns never appear in the
    /// payload.
    pub fn update(&self, entry: &ManagedEntry) -> Option<ChangeSet> {
        let old = entry.snapshot.as_ref()?;
        let new = entry.plan.record(&entry.current_row());
        let changes = self.comparator.diff(&entry.plan, old, &new);

        let row = entry.current_row();
        let mut payload: Vec<(&'static str, Value)> = Vec::new();
        for change in &changes {
            let Some(root) = entry.plan.root_column(&change.path) else {
                continue;
            };
            if entry.plan.is_pk_column(root) {
                continue;
            }
            if Some(root) == entry.plan.version_column {
                continue;
            }
            if payload.iter().any(|(c, _)| *c == root) {
                continue;
            }
            let value = row.get_by_name(root).cloned().unwrap_or(Value::Null);
            payload.push((root, value));
        }

        if payload.is_empty() && !entry.force_version_bump {
            return None;
        }

        let mut version_check = None;
        if let Some(vcol) = entry.plan.version_column {
            let expected = old.get(vcol).cloned().unwrap_or(Value::Null);
            if let Some(n) = expected.as_i64() {
                payload.push((vcol, Value::BigInt(n + 1)));
            }
            version_check = Some((vcol, expected));
        }

        Some(ChangeSet {
            key: entry.key,
            table: entry.table,
            kind: ChangeKind::Update,
            payload,
            version_check,
            suppressed_columns: Vec::new(),
            deferred_columns: Vec::new(),
        })
    }

    /// Delete, optionally scheduled ahead of creates.
    pub fn delete(&self, entry: &ManagedEntry, early: bool) -> ChangeSet {
        let version_check = entry.plan.version_column.and_then(|vcol| {
            entry
                .snapshot
                .as_ref()
                .and_then(|s| s.get(vcol))
                .map(|v| (vcol, v.clone()))
        });
        ChangeSet {
            key: entry.key,
            table: entry.table,
            kind: if early {
                ChangeKind::DeleteEarly
            } else {
                ChangeKind::Delete
            },
            payload: Vec::new(),
            version_check,
            suppressed_columns: Vec::new(),
            deferred_columns: Vec::new(),
        }
    }

    /// A deferred update that writes foreign key columns after the
    /// rest of a dependency cycle exists.
    pub fn deferred(&self, entry: &ManagedEntry, columns: Vec<&'static str>) -> ChangeSet {
        ChangeSet {
            key: entry.key,
            table: entry.table,
            kind: ChangeKind::Update,
            payload: Vec::new(),
            version_check: None,
            suppressed_columns: Vec::new(),
            deferred_columns: columns,
        }
    }
}
