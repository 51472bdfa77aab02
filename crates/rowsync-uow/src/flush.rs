//! The flush pipeline.
//!
//! A flush walks fixed stages: collect scheduled work and expand
//! cascades, diff snapshots into change sets, order them by foreign
//! key dependencies, execute against the driver, then reconcile
//! in-memory state. Writes run inside a transaction when the context
//! is configured all-or-nothing and the caller has not opened one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use rowsync_core::{Driver, Error, Result, Row, Value, ValidationError};

use crate::cascade::{self, Cascade};
use crate::change_set::{ChangeKind, ChangeSet, ChangeSetBuilder};
use crate::identity_map::{EntityState, ManagedEntry, ObjectKey};
use crate::lock::verify_versioned_write;
use crate::{Context, PendingLink};

/// Unwrap an `Outcome`, propagating everything that is not `Ok`.
macro_rules! check {
    ($outcome:expr) => {
        match $outcome {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(c) => return Outcome::Cancelled(c),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside an `Outcome`-returning function.
macro_rules! ensure_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => return Outcome::Err(e.into()),
        }
    };
}

pub(crate) use check;
pub(crate) use ensure_ok;

/// Where a flush currently is. `Idle` outside of flush; anything else
/// makes a nested flush a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushStage {
    #[default]
    Idle,
    Collecting,
    Diffing,
    Ordering,
    Persisting,
    Reconciling,
}

/// What a completed flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Deterministic ordering for keys of the same table: assigned keys by
/// hash, then new entities in registration order.
fn key_rank(key: ObjectKey) -> (u8, u64) {
    match key {
        ObjectKey::Assigned { pk_hash, .. } => (0, pk_hash),
        ObjectKey::Transient { serial, .. } => (1, serial),
    }
}

impl<D: Driver> Context<D> {
    /// Write every pending change to the store.
    ///
    /// New entities scheduled through [`Context::persist`] (and those
    /// reachable from them via persist cascades) are inserted, dirty
    /// managed entities are updated with minimal payloads, removed
    /// entities are deleted last. Dependency order is derived from
    /// foreign key metadata; cycles are split by withholding the
    /// offending columns and patching them with deferred updates.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.stage != FlushStage::Idle {
            return Outcome::Err(ValidationError::reentrant_flush().into());
        }
        if let Some(hook) = &self.events.before_flush {
            hook();
        }
        let result = self.flush_inner(cx).await;
        self.stage = FlushStage::Idle;
        if let Outcome::Ok(report) = &result {
            if let Some(hook) = &self.events.after_flush {
                hook(report);
            }
        }
        result
    }

    async fn flush_inner(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        self.stage = FlushStage::Collecting;
        let scheduled = self.collect();

        self.stage = FlushStage::Diffing;
        let mut changes = ensure_ok!(self.compute_change_sets(&scheduled));

        self.stage = FlushStage::Ordering;
        self.order_changes(&mut changes);
        tracing::debug!(changes = changes.len(), "flush ordered");

        if changes.is_empty() && self.pending_links.is_empty() {
            self.reconcile(&changes);
            return Outcome::Ok(FlushReport::default());
        }

        let own_tx = self.config.all_or_nothing && self.tx.is_none();
        if own_tx {
            self.tx = Some(check!(self.driver.begin(cx, None).await));
        }

        self.stage = FlushStage::Persisting;
        match self.execute(cx, &changes).await {
            Outcome::Ok(report) => {
                if own_tx {
                    if let Some(token) = self.tx.take() {
                        if let Some(hook) = &self.events.before_commit {
                            hook();
                        }
                        check!(self.driver.commit(cx, token).await);
                        if let Some(hook) = &self.events.after_commit {
                            hook();
                        }
                    }
                }
                self.stage = FlushStage::Reconciling;
                self.reconcile(&changes);
                Outcome::Ok(report)
            }
            Outcome::Err(e) => {
                self.abandon_own_tx(cx, own_tx).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(c) => {
                self.abandon_own_tx(cx, own_tx).await;
                Outcome::Cancelled(c)
            }
            Outcome::Panicked(p) => {
                self.abandon_own_tx(cx, own_tx).await;
                Outcome::Panicked(p)
            }
        }
    }

    async fn abandon_own_tx(&mut self, cx: &Cx, own_tx: bool) {
        if !own_tx {
            return;
        }
        let Some(token) = self.tx.take() else { return };
        if let Outcome::Err(e) = self.driver.rollback(cx, token).await {
            tracing::warn!(error = %e, "rollback after failed flush also failed");
        }
        if let Some(hook) = &self.events.after_rollback {
            hook();
        }
    }

    /// Expand cascades and settle entity states. Returns the keys of
    /// new entities that are actually scheduled for insert.
    fn collect(&mut self) -> HashSet<ObjectKey> {
        let scheduled: HashSet<ObjectKey> =
            cascade::expand(&self.identity, &self.pending_persist, Cascade::Persist)
                .into_iter()
                .filter(|k| {
                    self.identity
                        .get(*k)
                        .is_some_and(|e| e.state == EntityState::New)
                })
                .collect();

        let mut remove_roots = self.pending_remove.clone();
        remove_roots.extend(self.pending_orphans.iter().copied());
        let mut dropped = Vec::new();
        for key in cascade::expand(&self.identity, &remove_roots, Cascade::Remove) {
            if let Some(entry) = self.identity.get_mut(key) {
                if entry.state == EntityState::New {
                    // Never persisted; nothing to delete.
                    dropped.push(key);
                } else {
                    entry.state = EntityState::Removed;
                }
            }
        }
        for key in &dropped {
            self.identity.remove(*key);
        }
        scheduled
    }

    /// Diff every tracked entity into change sets.
    #[allow(clippy::result_large_err)]
    fn compute_change_sets(&mut self, scheduled: &HashSet<ObjectKey>) -> Result<Vec<ChangeSet>> {
        self.apply_resolvable_links()?;

        // Links whose source has no key yet, targeting entities that
        // are already in the store: patched by a deferred update once
        // the source row exists.
        let mut deferred: HashMap<ObjectKey, Vec<&'static str>> = HashMap::new();
        for link in &self.pending_links {
            if let PendingLink::SetForeignKey { entity, column, .. } = link {
                let key = self.identity.resolve(*entity);
                if self
                    .identity
                    .get(key)
                    .is_some_and(|e| e.state == EntityState::Managed)
                {
                    let columns = deferred.entry(key).or_default();
                    if !columns.contains(column) {
                        columns.push(column);
                    }
                }
            }
        }

        let comparator = self.comparator.clone();
        let builder = ChangeSetBuilder::new(&comparator);
        let mut changes = Vec::new();

        // Rows displaced by a same-key re-registration are deleted
        // ahead of the creates so their unique values free up.
        for entry in &self.evicted {
            changes.push(builder.delete(entry, true));
        }

        let mut entries: Vec<(&ObjectKey, &ManagedEntry)> = self.identity.iter().collect();
        entries.sort_by_key(|(k, _)| key_rank(**k));
        for (key, entry) in entries {
            match entry.state {
                EntityState::New if scheduled.contains(key) => changes.push(builder.create(entry)),
                EntityState::Managed => {
                    if let Some(cs) = builder.update(entry) {
                        changes.push(cs);
                    }
                }
                EntityState::Removed => changes.push(builder.delete(entry, false)),
                _ => {}
            }
        }

        let mut deferred: Vec<(ObjectKey, Vec<&'static str>)> = deferred.into_iter().collect();
        deferred.sort_by_key(|(k, _)| key_rank(*k));
        for (key, columns) in deferred {
            if let Some(entry) = self.identity.get(key) {
                changes.push(builder.deferred(entry, columns));
            }
        }
        Ok(changes)
    }

    /// Sort change sets into execution order and split dependency
    /// cycles.
    ///
    /// Creates run in dependency order, deletes in reverse. Creates of
    /// a table inside a broken cycle withhold the offending foreign
    /// keys and get a deferred patch instead.
    fn order_changes(&self, changes: &mut Vec<ChangeSet>) {
        let tables: Vec<&'static str> = changes.iter().map(|cs| cs.table).collect();
        let order = self.graph.commit_order(&tables);

        let mut patches: Vec<(ObjectKey, Vec<&'static str>)> = Vec::new();
        for cs in changes.iter_mut().filter(|c| c.is_create()) {
            let Some(entry) = self.identity.get(cs.key) else {
                continue;
            };
            for &(column, target) in &entry.plan.fk_columns {
                if order.must_defer(cs.table, target) && !cs.suppressed_columns.contains(&column) {
                    cs.suppressed_columns.push(column);
                }
            }
            if !cs.suppressed_columns.is_empty() {
                patches.push((cs.key, cs.suppressed_columns.clone()));
            }
        }
        let comparator = self.comparator.clone();
        let builder = ChangeSetBuilder::new(&comparator);
        for (key, columns) in patches {
            if let Some(entry) = self.identity.get(key) {
                changes.push(builder.deferred(entry, columns));
            }
        }

        changes.sort_by_key(|cs| {
            let pos = order.position(cs.table).unwrap_or(usize::MAX);
            match cs.kind {
                ChangeKind::DeleteEarly => (0usize, 0usize),
                ChangeKind::Create => (1, pos),
                ChangeKind::Update if cs.is_deferred() => (2, pos),
                ChangeKind::Update => (3, pos),
                ChangeKind::Delete => (4, usize::MAX - pos),
            }
        });
    }

    async fn execute(&mut self, cx: &Cx, changes: &[ChangeSet]) -> Outcome<FlushReport, Error> {
        let driver = Arc::clone(&self.driver);
        let tx = self.tx;
        let mut report = FlushReport::default();

        for cs in changes.iter().filter(|c| c.kind == ChangeKind::DeleteEarly) {
            let (cond, pk) = ensure_ok!(self.delete_cond(cs));
            let result = check!(driver.delete(cx, cs.table, &cond, tx).await);
            ensure_ok!(verify_versioned_write(
                cs.table,
                pk,
                cs.version_check.as_ref(),
                &result
            ));
            report.deleted += 1;
        }

        // Inserts. Tables with a generated key go row by row so the
        // returned key can be written back; others batch per table.
        let creates: Vec<&ChangeSet> = changes.iter().filter(|c| c.is_create()).collect();
        let mut idx = 0;
        while idx < creates.len() {
            let cs = creates[idx];
            let batchable = cs.suppressed_columns.is_empty()
                && self
                    .identity
                    .get(cs.key)
                    .is_some_and(|e| e.plan.generated_key.is_none());
            if batchable {
                let mut end = idx + 1;
                while end < creates.len()
                    && creates[end].table == cs.table
                    && creates[end].suppressed_columns.is_empty()
                {
                    end += 1;
                }
                let batch = &creates[idx..end];
                let mut columns: Vec<&'static str> = Vec::new();
                let mut rows = Vec::with_capacity(batch.len());
                for cs in batch {
                    ensure_ok!(self.apply_resolvable_links());
                    let payload = ensure_ok!(self.create_payload(cs));
                    if columns.is_empty() {
                        columns = payload.iter().map(|(c, _)| *c).collect();
                    }
                    rows.push(payload.into_iter().map(|(_, v)| v).collect());
                }
                check!(driver.insert_many(cx, cs.table, &columns, rows, tx).await);
                for cs in batch {
                    ensure_ok!(self.finish_create(cs.key, None));
                    report.created += 1;
                }
                idx = end;
            } else {
                ensure_ok!(self.apply_resolvable_links());
                let payload = ensure_ok!(self.create_payload(cs));
                let columns: Vec<&'static str> = payload.iter().map(|(c, _)| *c).collect();
                let values: Vec<Value> = payload.into_iter().map(|(_, v)| v).collect();
                let result = check!(driver.insert(cx, cs.table, &columns, values, tx).await);
                ensure_ok!(self.finish_create(cs.key, result.insert_id));
                report.created += 1;
                idx += 1;
            }
        }
        let created_keys: HashSet<ObjectKey> = creates
            .iter()
            .map(|c| self.identity.resolve(c.key))
            .collect();

        // Relation maintenance, now that every scheduled row exists.
        let link_work = ensure_ok!(self.finish_links());
        let mut link_removals = Vec::new();
        for work in link_work {
            match work {
                PendingLink::AddLinkRow { link, left, right } => {
                    let left_pk = ensure_ok!(self.link_pk(left, link.table));
                    let right_pk = ensure_ok!(self.link_pk(right, link.table));
                    check!(
                        driver
                            .insert(
                                cx,
                                link.table,
                                &[link.local_column, link.remote_column],
                                vec![left_pk, right_pk],
                                tx,
                            )
                            .await
                    );
                }
                PendingLink::RemoveLinkRow { .. } => link_removals.push(work),
                PendingLink::SetForeignKey { .. } => {}
            }
        }

        // Deferred foreign key patches.
        for cs in changes.iter().filter(|c| c.is_deferred()) {
            let (set, cond) = {
                let Some(entry) = self.identity.get(cs.key) else {
                    continue;
                };
                let row = entry.current_row();
                let set: Vec<(&'static str, Value)> = cs
                    .deferred_columns
                    .iter()
                    .map(|col| {
                        (
                            *col,
                            row.get_by_name(col).cloned().unwrap_or(Value::Null),
                        )
                    })
                    .collect();
                (set, ensure_ok!(entry.pk_cond()))
            };
            check!(driver.update(cx, cs.table, &set, &cond, tx).await);
            if !created_keys.contains(&self.identity.resolve(cs.key)) {
                report.updated += 1;
            }
        }

        // Updates.
        for cs in changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Update && !c.is_deferred())
        {
            let (cond, pk) = {
                let Some(entry) = self.identity.get(cs.key) else {
                    continue;
                };
                let mut cond = ensure_ok!(entry.pk_cond());
                if let Some(vcheck) = &cs.version_check {
                    cond.push(vcheck.clone());
                }
                (cond, entry.primary_key())
            };
            let result = check!(driver.update(cx, cs.table, &cs.payload, &cond, tx).await);
            ensure_ok!(verify_versioned_write(
                cs.table,
                pk,
                cs.version_check.as_ref(),
                &result
            ));
            // Fold the version bump back into the live entity.
            if let Some((vcol, _)) = cs.version_check.as_ref() {
                if let Some((_, bumped)) = cs.payload.iter().find(|(c, _)| c == vcol) {
                    if let Some(entry) = self.identity.get(cs.key) {
                        ensure_ok!(entry.apply_row(&Row::single(vcol, bumped.clone())));
                    }
                }
            }
            report.updated += 1;
        }

        // Deletes, children before parents. Link table rows go first.
        for work in link_removals {
            if let PendingLink::RemoveLinkRow { link, left, right } = work {
                let left_pk = ensure_ok!(self.link_pk(left, link.table));
                let right_pk = ensure_ok!(self.link_pk(right, link.table));
                check!(
                    driver
                        .delete(
                            cx,
                            link.table,
                            &[
                                (link.local_column, left_pk),
                                (link.remote_column, right_pk),
                            ],
                            tx,
                        )
                        .await
                );
            }
        }
        for cs in changes.iter().filter(|c| c.kind == ChangeKind::Delete) {
            let (cond, pk) = ensure_ok!(self.delete_cond(cs));
            let link_conds: Vec<(&'static str, Vec<(&'static str, Value)>)> = {
                let Some(entry) = self.identity.get(cs.key) else {
                    continue;
                };
                entry
                    .relations()
                    .iter()
                    .filter_map(|r| r.link)
                    .filter_map(|l| {
                        pk.first()
                            .map(|v| (l.table, vec![(l.local_column, v.clone())]))
                    })
                    .collect()
            };
            for (table, lcond) in link_conds {
                check!(driver.delete(cx, table, &lcond, tx).await);
            }
            let result = check!(driver.delete(cx, cs.table, &cond, tx).await);
            ensure_ok!(verify_versioned_write(
                cs.table,
                pk,
                cs.version_check.as_ref(),
                &result
            ));
            report.deleted += 1;
        }

        Outcome::Ok(report)
    }

    /// Apply every pending foreign key assignment whose source key is
    /// known, merging the value into the live entity.
    #[allow(clippy::result_large_err)]
    pub(crate) fn apply_resolvable_links(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.pending_links.len() {
            let applied = match &self.pending_links[i] {
                PendingLink::SetForeignKey {
                    entity,
                    column,
                    source,
                } => match self.link_value(*source) {
                    Some(value) => {
                        if let Some(entry) = self.identity.get(*entity) {
                            entry.apply_row(&Row::single(column, value))?;
                        }
                        true
                    }
                    None => false,
                },
                _ => false,
            };
            if applied {
                self.pending_links.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Value a pending link would write: the source's single-column
    /// primary key, null for an unlink, `None` while the source has no
    /// key yet.
    fn link_value(&self, source: Option<ObjectKey>) -> Option<Value> {
        let Some(source) = source else {
            return Some(Value::Null);
        };
        let entry = self.identity.get(source)?;
        let pk = entry.primary_key();
        match pk.first() {
            Some(v) if !v.is_null() => Some(v.clone()),
            _ => None,
        }
    }

    /// Drain the link queue after inserts. Every foreign key must be
    /// resolvable by now; what remains is link table row maintenance.
    #[allow(clippy::result_large_err)]
    fn finish_links(&mut self) -> Result<Vec<PendingLink>> {
        self.apply_resolvable_links()?;
        for link in &self.pending_links {
            if let PendingLink::SetForeignKey { source, .. } = link {
                let table = source
                    .and_then(|k| self.identity.get(k))
                    .map_or("<detached>", |e| e.table);
                return Err(ValidationError::missing_primary_key(table).into());
            }
        }
        Ok(std::mem::take(&mut self.pending_links))
    }

    #[allow(clippy::result_large_err)]
    fn link_pk(&self, key: ObjectKey, link_table: &str) -> Result<Value> {
        let entry = self
            .identity
            .get(key)
            .ok_or_else(|| Error::from(ValidationError::not_managed(link_table)))?;
        entry
            .primary_key()
            .into_iter()
            .next()
            .filter(|v| !v.is_null())
            .ok_or_else(|| ValidationError::missing_primary_key(entry.table).into())
    }

    /// Insert payload for a create, recomputed at execution time so
    /// foreign keys resolved earlier in the same flush are picked up.
    #[allow(clippy::result_large_err)]
    fn create_payload(&self, cs: &ChangeSet) -> Result<Vec<(&'static str, Value)>> {
        let entry = self
            .identity
            .get(cs.key)
            .ok_or_else(|| Error::from(ValidationError::not_managed(cs.table)))?;
        let fresh = ChangeSetBuilder::new(&self.comparator).create(entry);
        Ok(fresh
            .payload
            .into_iter()
            .filter(|(c, _)| !cs.suppressed_columns.contains(c))
            .collect())
    }

    /// Write back a generated key, seed the version column and promote
    /// the entry to its assigned identity.
    #[allow(clippy::result_large_err)]
    fn finish_create(&mut self, key: ObjectKey, insert_id: Option<i64>) -> Result<()> {
        if let Some(entry) = self.identity.get(key) {
            if let (Some(id), Some(_)) = (insert_id, entry.plan.generated_key) {
                entry.set_generated_key(Value::BigInt(id));
            }
            if let Some(vcol) = entry.plan.version_column {
                if entry.version_value().is_none_or(|v| v.is_null()) {
                    entry.apply_row(&Row::single(vcol, Value::BigInt(1)))?;
                }
            }
        }
        self.identity.promote(key);
        Ok(())
    }

    fn entry_for(&self, key: ObjectKey) -> Option<&ManagedEntry> {
        self.identity
            .get(key)
            .or_else(|| self.evicted.iter().find(|e| e.key == key))
    }

    #[allow(clippy::result_large_err)]
    fn delete_cond(
        &self,
        cs: &ChangeSet,
    ) -> Result<(Vec<(&'static str, Value)>, Vec<Value>)> {
        let entry = self
            .entry_for(cs.key)
            .ok_or_else(|| Error::from(ValidationError::not_managed(cs.table)))?;
        let mut cond = entry.pk_cond()?;
        let pk = entry.primary_key();
        if let Some(vcheck) = &cs.version_check {
            cond.push(vcheck.clone());
        }
        Ok((cond, pk))
    }

    /// Settle in-memory state after the store accepted every write.
    fn reconcile(&mut self, changes: &[ChangeSet]) {
        for cs in changes {
            match cs.kind {
                ChangeKind::Create | ChangeKind::Update => {
                    let key = self.identity.resolve(cs.key);
                    if let Some(entry) = self.identity.get_mut(key) {
                        entry.state = EntityState::Managed;
                        entry.force_version_bump = false;
                        entry.refresh_snapshot();
                    }
                }
                ChangeKind::Delete | ChangeKind::DeleteEarly => {
                    // A re-registration may own the same key by now;
                    // only drop entries that were actually removed.
                    if self
                        .identity
                        .get(cs.key)
                        .is_some_and(|e| e.state == EntityState::Removed)
                    {
                        self.identity.remove(cs.key);
                    }
                }
            }
        }
        self.evicted.clear();
        self.pending_persist.clear();
        self.pending_remove.clear();
        self.pending_orphans.clear();
        tracing::debug!(tracked = self.identity.len(), "flush reconciled");
    }
}
