//! Cascade expansion.
//!
//! At flush start, scheduled persists and removes are expanded along
//! relations flagged for cascading. Expansion never walks object
//! graphs; it scans the identity map, matching foreign key columns
//! against parent primary keys, so only tracked entities are reached.

use std::collections::HashSet;

use rowsync_core::RelationKind;
#[cfg(test)]
use rowsync_core::Value;
use tracing::trace;

use crate::identity_map::{IdentityMap, ManagedEntry, ObjectKey};

/// Direction of a cascade walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    Persist,
    Remove,
}

/// Expand the given roots along cascading relations.
///
/// Returns the roots plus every reachable key, deduplicated, in
/// deterministic discovery order (depth-first from each root).
pub fn expand(map: &IdentityMap, roots: &[ObjectKey], direction: Cascade) -> Vec<ObjectKey> {
    let mut seen: HashSet<ObjectKey> = HashSet::new();
    let mut out: Vec<ObjectKey> = Vec::new();
    let mut stack: Vec<ObjectKey> = Vec::new();

    for root in roots {
        let root = map.resolve(*root);
        if seen.insert(root) {
            out.push(root);
            stack.push(root);
        }
        while let Some(key) = stack.pop() {
            let Some(entry) = map.get(key) else { continue };
            for next in neighbors(map, entry, direction) {
                let next = map.resolve(next);
                if seen.insert(next) {
                    trace!(?key, ?next, ?direction, "cascade reached entity");
                    out.push(next);
                    stack.push(next);
                }
            }
        }
    }
    out
}

fn neighbors(map: &IdentityMap, entry: &ManagedEntry, direction: Cascade) -> Vec<ObjectKey> {
    let mut found = Vec::new();
    let row = entry.current_row();
    for relation in entry.relations() {
        let follows = match direction {
            Cascade::Persist => relation.cascade_persist,
            Cascade::Remove => relation.cascade_remove || relation.orphan_removal,
        };
        if !follows {
            continue;
        }
        // For OneToOne the foreign key may sit on either side; check
        // the local row to find out.
        let fk_is_local = match relation.kind {
            RelationKind::ManyToOne => true,
            RelationKind::OneToMany => false,
            RelationKind::OneToOne => row.contains_column(relation.fk_column),
            // Link rows are handled by the flush itself; the far side
            // is never cascaded implicitly.
            RelationKind::ManyToMany => continue,
        };
        if fk_is_local {
            // We carry the foreign key: follow it to the parent.
            let Some(fk) = row.get_by_name(relation.fk_column) else {
                continue;
            };
            if fk.is_null() {
                continue;
            }
            if let Some(parent) =
                map.find_by_table_pk(relation.target_table, std::slice::from_ref(fk))
            {
                found.push(parent);
            }
        } else {
            // Far side carries the foreign key: find tracked rows of
            // the target table pointing back at us.
            let pk = entry.primary_key();
            let Some(pk_value) = pk.first().filter(|v| !v.is_null()) else {
                continue;
            };
            found.extend(map.find_children(
                relation.target_table,
                relation.fk_column,
                pk_value,
            ));
        }
    }
    found
}

/// Foreign key value of a tracked child, for tests and diagnostics.
#[cfg(test)]
pub(crate) fn fk_of(map: &IdentityMap, key: ObjectKey, column: &str) -> Option<Value> {
    map.get(key)
        .and_then(|e| e.current_row().get_by_name(column).cloned())
}
