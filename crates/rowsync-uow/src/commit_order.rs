//! Table-level dependency graph and commit ordering.
//!
//! Creates run parents before children, deletes run children before
//! parents. The graph is built from foreign key metadata as entity
//! types are registered. Cycles are not an error: the ordering breaks
//! them and reports which foreign keys must be written by a deferred
//! update after all cycle members exist.

use std::collections::{HashMap, HashSet};

use crate::snapshot::SnapshotPlan;

/// Foreign-key dependencies between tables: table -> referenced tables.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: HashMap<&'static str, Vec<&'static str>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the dependencies a snapshot plan declares.
    pub fn register_plan(&mut self, plan: &SnapshotPlan) {
        let entry = self.deps.entry(plan.table).or_default();
        for &(_, target) in &plan.fk_columns {
            if !entry.contains(&target) {
                entry.push(target);
            }
        }
    }

    /// Tables the given table references.
    pub fn parents_of(&self, table: &str) -> &[&'static str] {
        self.deps.get(table).map_or(&[], Vec::as_slice)
    }

    /// Compute a commit order for the given tables.
    ///
    /// Stable Kahn ordering: among ready tables, first appearance in
    /// the input wins, so repeated flushes of the same working set
    /// produce identical plans. When no table is ready, the first
    /// still-pending one is emitted anyway and marked broken; its
    /// forward references are handled via [`CommitOrder::must_defer`].
    pub fn commit_order(&self, tables: &[&'static str]) -> CommitOrder {
        let mut pending: Vec<&'static str> = Vec::new();
        for t in tables {
            if !pending.contains(t) {
                pending.push(t);
            }
        }
        let in_play: HashSet<&'static str> = pending.iter().copied().collect();

        let mut order: Vec<&'static str> = Vec::new();
        let mut emitted: HashSet<&'static str> = HashSet::new();
        let mut broken: HashSet<&'static str> = HashSet::new();

        while !pending.is_empty() {
            let ready = pending.iter().position(|t| {
                self.parents_of(t)
                    .iter()
                    .all(|p| *p == *t || !in_play.contains(p) || emitted.contains(p))
            });
            let idx = match ready {
                Some(i) => i,
                None => {
                    broken.insert(pending[0]);
                    0
                }
            };
            let table = pending.remove(idx);
            emitted.insert(table);
            order.push(table);
        }

        let positions = order
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, i))
            .collect();
        CommitOrder {
            tables: order,
            positions,
            broken,
        }
    }
}

/// The result of ordering a set of tables.
#[derive(Debug)]
pub struct CommitOrder {
    /// Tables in create order (parents first). Deletes use the
    /// reverse.
    pub tables: Vec<&'static str>,
    positions: HashMap<&'static str, usize>,
    broken: HashSet<&'static str>,
}

impl CommitOrder {
    /// Position of a table in create order.
    pub fn position(&self, table: &str) -> Option<usize> {
        self.positions.get(table).copied()
    }

    /// Whether the ordering had to break a cycle at this table.
    pub fn is_broken(&self, table: &str) -> bool {
        self.broken.contains(table)
    }

    /// Must a foreign key of `table` referencing `target` be withheld
    /// from the insert and written by a deferred update?
    ///
    /// True for self-references and for references to tables created
    /// later in this plan. References to tables outside the plan point
    /// at rows that already exist, so they never defer.
    pub fn must_defer(&self, table: &str, target: &str) -> bool {
        if table == target {
            return true;
        }
        match (self.position(table), self.position(target)) {
            (Some(t), Some(u)) => u > t,
            _ => false,
        }
    }
}
