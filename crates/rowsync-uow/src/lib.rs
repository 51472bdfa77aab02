//! Change tracking and unit-of-work persistence for rowsync.
//!
//! A [`Context`] tracks entities loaded through it or handed to
//! [`Context::persist`], detects changes by diffing snapshots, and
//! writes everything out in dependency order on [`Context::flush`].
//! Within one context the identity map guarantees a single live
//! instance per (type, primary key).
//!
//! ```ignore
//! let mut ctx = Context::new(driver);
//! let team = ctx.persist(Team::new("Avengers"));
//! let hero = ctx.persist(Hero::new("Iron Man"));
//! ctx.link(&hero, "team", &team)?;
//! ctx.flush(&cx).await.into_result()?;
//! ```

pub mod cascade;
pub mod change_set;
pub mod commit_order;
pub mod comparator;
pub mod flush;
pub mod identity_map;
pub mod lock;
pub mod snapshot;

pub use cascade::Cascade;
pub use change_set::{ChangeKind, ChangeSet, ChangeSetBuilder};
pub use commit_order::{CommitOrder, DependencyGraph};
pub use comparator::{Comparator, FieldChange, semantic_eq};
pub use flush::{FlushReport, FlushStage};
pub use identity_map::{EntityState, IdentityMap, ManagedEntry, ObjectKey, Registration};
pub use lock::LockMode;
pub use snapshot::{SnapshotPlan, SnapshotPlans, SnapshotRecord};

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use asupersync::{Cx, Outcome};
use rowsync_core::{
    Cond, Driver, Entity, Error, LinkMeta, RelationKind, Result, Row, TransactionError, TxToken,
    ValidationError, Value,
};

use crate::flush::{check, ensure_ok};

/// Handle to an entity tracked by a [`Context`].
///
/// Cheap to clone; all clones point at the same live instance. The
/// entity itself sits behind a read-write lock, accessed through
/// [`Managed::read`] and [`Managed::write`].
pub struct Managed<E> {
    key: ObjectKey,
    handle: Arc<RwLock<E>>,
}

impl<E> Clone for Managed<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<E: Entity> Managed<E> {
    /// Identity of the entity within its context.
    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.handle.read().expect("entity lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.handle.write().expect("entity lock poisoned")
    }

    /// Whether two handles point at the same live instance.
    pub fn ptr_eq(&self, other: &Managed<E>) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl<E> std::fmt::Debug for Managed<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Managed").field("key", &self.key).finish()
    }
}

/// A relation change recorded by [`Context::link`] or
/// [`Context::unlink`], applied once the referenced keys exist.
#[derive(Debug)]
pub(crate) enum PendingLink {
    /// Write `column` on `entity` with the primary key of `source`,
    /// or null when unlinking.
    SetForeignKey {
        entity: ObjectKey,
        column: &'static str,
        source: Option<ObjectKey>,
    },
    AddLinkRow {
        link: LinkMeta,
        left: ObjectKey,
        right: ObjectKey,
    },
    RemoveLinkRow {
        link: LinkMeta,
        left: ObjectKey,
        right: ObjectKey,
    },
}

/// When reads trigger an implicit flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Only on commit or an explicit [`Context::flush`]
    Commit,
    /// Before a read, when a queued or unflushed change could alter
    /// what that read returns
    #[default]
    Auto,
    /// Before every read
    Always,
}

/// Context configuration.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    pub flush_mode: FlushMode,
    /// Run each flush inside its own transaction unless the caller
    /// already opened one
    pub all_or_nothing: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::default(),
            all_or_nothing: true,
        }
    }
}

/// Lifecycle hooks. All of them run synchronously on the flushing
/// task.
#[derive(Default)]
pub struct ContextEvents {
    pub before_flush: Option<Box<dyn Fn() + Send + Sync>>,
    pub after_flush: Option<Box<dyn Fn(&FlushReport) + Send + Sync>>,
    pub before_commit: Option<Box<dyn Fn() + Send + Sync>>,
    pub after_commit: Option<Box<dyn Fn() + Send + Sync>>,
    pub after_rollback: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Work a context has queued for the next flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities awaiting insert
    pub new: usize,
    /// Entities scheduled for delete
    pub removed: usize,
    /// Recorded relation changes
    pub links: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.removed + self.links
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// The unit of work.
///
/// Owns the identity map and all scheduling state; talks to storage
/// only through its [`Driver`]. A context is not `Sync` -- share work
/// across tasks by [`Context::fork`]ing and merging back.
pub struct Context<D: Driver> {
    driver: Arc<D>,
    config: ContextConfig,
    comparator: Comparator,
    plans: SnapshotPlans,
    graph: DependencyGraph,
    identity: IdentityMap,
    pending_persist: Vec<ObjectKey>,
    pending_remove: Vec<ObjectKey>,
    pending_orphans: Vec<ObjectKey>,
    pending_links: Vec<PendingLink>,
    /// Entries displaced by re-registering the same primary key after
    /// a remove; deleted ahead of the creates.
    evicted: Vec<ManagedEntry>,
    stage: FlushStage,
    tx: Option<TxToken>,
    events: ContextEvents,
}

impl<D: Driver> Context<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, ContextConfig::default())
    }

    pub fn with_config(driver: D, config: ContextConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            config,
            comparator: Comparator::new(),
            plans: SnapshotPlans::new(),
            graph: DependencyGraph::new(),
            identity: IdentityMap::new(),
            pending_persist: Vec::new(),
            pending_remove: Vec::new(),
            pending_orphans: Vec::new(),
            pending_links: Vec::new(),
            evicted: Vec::new(),
            stage: FlushStage::default(),
            tx: None,
            events: ContextEvents::default(),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The comparator used for dirty checking. Register named equality
    /// hooks here before loading entities that reference them.
    pub fn comparator(&self) -> &Comparator {
        &self.comparator
    }

    pub fn events_mut(&mut self) -> &mut ContextEvents {
        &mut self.events
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) {
        self.config.flush_mode = mode;
    }

    fn register_type<E: Entity>(&mut self) -> Arc<SnapshotPlan> {
        let plan = self.plans.plan_for::<E>();
        self.graph.register_plan(&plan);
        plan
    }

    /// Track an entity and schedule it for insert.
    ///
    /// Handing over an entity whose identity is already tracked
    /// returns the existing instance; the offered one is dropped. A
    /// tracked-but-removed entity with the same key is evicted and
    /// deleted ahead of the insert, so unique values can be reused
    /// within one flush.
    pub fn persist<E: Entity>(&mut self, entity: E) -> Managed<E> {
        let plan = self.register_type::<E>();

        let pk = entity.primary_key();
        if !pk.is_empty() && !pk.iter().any(Value::is_null) {
            let key = self.identity.resolve(ObjectKey::assigned::<E>(&pk));
            let removed = self
                .identity
                .get(key)
                .is_some_and(|e| e.state == EntityState::Removed)
                || self.pending_remove.contains(&key)
                || self.pending_orphans.contains(&key);
            if removed {
                if let Some(mut old) = self.identity.remove(key) {
                    // A never-persisted entry has no row to delete.
                    if old.state != EntityState::New {
                        old.state = EntityState::Removed;
                        self.evicted.push(old);
                    }
                }
                self.pending_remove.retain(|k| *k != key);
                self.pending_orphans.retain(|k| *k != key);
            }
        }

        let reg = self
            .identity
            .register(entity, EntityState::New, None, plan);
        tracing::trace!(table = E::TABLE_NAME, existed = reg.existed, "persist");
        self.pending_persist.push(reg.key);
        Managed {
            key: reg.key,
            handle: reg.handle,
        }
    }

    pub fn persist_all<E: Entity>(&mut self, entities: Vec<E>) -> Vec<Managed<E>> {
        entities.into_iter().map(|e| self.persist(e)).collect()
    }

    /// Schedule a tracked entity for delete. Entities reachable over
    /// remove cascades go with it at flush time.
    #[allow(clippy::result_large_err)]
    pub fn remove<E: Entity>(&mut self, handle: &Managed<E>) -> Result<()> {
        let key = self.identity.resolve(handle.key);
        if self.identity.get(key).is_none() {
            return Err(ValidationError::not_managed(E::TABLE_NAME).into());
        }
        tracing::trace!(table = E::TABLE_NAME, "remove");
        self.pending_remove.push(key);
        Ok(())
    }

    /// Schedule every handle in the slice for delete.
    #[allow(clippy::result_large_err)]
    pub fn remove_all<E: Entity>(&mut self, handles: &[Managed<E>]) -> Result<()> {
        for handle in handles {
            self.remove(handle)?;
        }
        Ok(())
    }

    /// Connect two tracked entities over a named relation.
    ///
    /// For foreign key relations the key value is written into the
    /// owning side as soon as it is known, at the latest during the
    /// next flush. Many-to-many relations insert a link table row.
    #[allow(clippy::result_large_err)]
    pub fn link<E: Entity, T: Entity>(
        &mut self,
        owner: &Managed<E>,
        relation: &str,
        target: &Managed<T>,
    ) -> Result<()> {
        let rel = Self::relation_of::<E>(relation)?;
        match rel.kind {
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                self.pending_links.push(PendingLink::SetForeignKey {
                    entity: owner.key,
                    column: rel.fk_column,
                    source: Some(target.key),
                });
            }
            RelationKind::OneToMany => {
                self.pending_links.push(PendingLink::SetForeignKey {
                    entity: target.key,
                    column: rel.fk_column,
                    source: Some(owner.key),
                });
            }
            RelationKind::ManyToMany => {
                let link = rel.link.ok_or_else(|| {
                    Error::Custom(format!("relation '{}' has no link table", rel.name))
                })?;
                self.pending_links.push(PendingLink::AddLinkRow {
                    link,
                    left: owner.key,
                    right: target.key,
                });
            }
        }
        self.apply_resolvable_links()
    }

    /// Disconnect two tracked entities.
    ///
    /// Foreign key relations have the owning column set to null;
    /// many-to-many relations lose their link table row. When the
    /// relation declares orphan removal the disconnected target is
    /// scheduled for delete.
    #[allow(clippy::result_large_err)]
    pub fn unlink<E: Entity, T: Entity>(
        &mut self,
        owner: &Managed<E>,
        relation: &str,
        target: &Managed<T>,
    ) -> Result<()> {
        let rel = Self::relation_of::<E>(relation)?;
        match rel.kind {
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                self.pending_links.push(PendingLink::SetForeignKey {
                    entity: owner.key,
                    column: rel.fk_column,
                    source: None,
                });
            }
            RelationKind::OneToMany => {
                self.pending_links.push(PendingLink::SetForeignKey {
                    entity: target.key,
                    column: rel.fk_column,
                    source: None,
                });
            }
            RelationKind::ManyToMany => {
                let link = rel.link.ok_or_else(|| {
                    Error::Custom(format!("relation '{}' has no link table", rel.name))
                })?;
                self.pending_links.push(PendingLink::RemoveLinkRow {
                    link,
                    left: owner.key,
                    right: target.key,
                });
            }
        }
        if rel.orphan_removal {
            self.pending_orphans.push(self.identity.resolve(target.key));
        }
        self.apply_resolvable_links()
    }

    #[allow(clippy::result_large_err)]
    fn relation_of<E: Entity>(relation: &str) -> Result<&'static rowsync_core::RelationMeta> {
        E::relations()
            .iter()
            .find(|r| r.name == relation)
            .ok_or_else(|| ValidationError::unknown_relation(E::TABLE_NAME, relation).into())
    }

    /// Fetch an entity by primary key. The identity map is consulted
    /// first; only a miss goes to the store.
    pub async fn get<E: Entity>(
        &mut self,
        cx: &Cx,
        pk: &[Value],
    ) -> Outcome<Option<Managed<E>>, Error> {
        let plan = self.register_type::<E>();
        let key = ObjectKey::assigned::<E>(pk);
        if self
            .identity
            .get(key)
            .is_some_and(|e| e.state != EntityState::Removed)
        {
            if let Some(handle) = self.identity.handle_of::<E>(key) {
                return Outcome::Ok(Some(Managed {
                    key: self.identity.resolve(key),
                    handle,
                }));
            }
        }
        check!(self.auto_flush(cx, E::TABLE_NAME).await);
        let cond: Vec<Cond> = plan
            .pk_columns
            .iter()
            .copied()
            .zip(pk.iter().cloned())
            .collect();
        let driver = Arc::clone(&self.driver);
        match check!(driver.find_one(cx, E::TABLE_NAME, &cond, self.tx).await) {
            Some(row) => Outcome::Ok(Some(ensure_ok!(self.track_row::<E>(&row, plan)))),
            None => Outcome::Ok(None),
        }
    }

    /// Fetch all rows matching the condition and track them. Rows
    /// whose identity is already tracked yield the existing instance;
    /// the fetched state is discarded for those.
    pub async fn find<E: Entity>(
        &mut self,
        cx: &Cx,
        cond: &[Cond],
    ) -> Outcome<Vec<Managed<E>>, Error> {
        let plan = self.register_type::<E>();
        check!(self.auto_flush(cx, E::TABLE_NAME).await);
        let driver = Arc::clone(&self.driver);
        let rows = check!(driver.find(cx, E::TABLE_NAME, cond, self.tx).await);
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ensure_ok!(self.track_row::<E>(&row, Arc::clone(&plan))));
        }
        Outcome::Ok(out)
    }

    /// Fetch the first row matching the condition, if any.
    pub async fn find_one<E: Entity>(
        &mut self,
        cx: &Cx,
        cond: &[Cond],
    ) -> Outcome<Option<Managed<E>>, Error> {
        let plan = self.register_type::<E>();
        check!(self.auto_flush(cx, E::TABLE_NAME).await);
        let driver = Arc::clone(&self.driver);
        match check!(driver.find_one(cx, E::TABLE_NAME, cond, self.tx).await) {
            Some(row) => Outcome::Ok(Some(ensure_ok!(self.track_row::<E>(&row, plan)))),
            None => Outcome::Ok(None),
        }
    }

    pub async fn find_one_or_fail<E: Entity>(
        &mut self,
        cx: &Cx,
        cond: &[Cond],
    ) -> Outcome<Managed<E>, Error> {
        match check!(self.find_one::<E>(cx, cond).await) {
            Some(managed) => Outcome::Ok(managed),
            None => Outcome::Err(Error::NotFound {
                table: E::TABLE_NAME,
            }),
        }
    }

    /// Overwrite a tracked entity with its current row from the store
    /// and reset its snapshot, discarding unflushed changes.
    pub async fn refresh<E: Entity>(
        &mut self,
        cx: &Cx,
        handle: &Managed<E>,
    ) -> Outcome<(), Error> {
        let key = self.identity.resolve(handle.key);
        let cond = {
            let Some(entry) = self.identity.get(key) else {
                return Outcome::Err(ValidationError::not_managed(E::TABLE_NAME).into());
            };
            ensure_ok!(entry.pk_cond())
        };
        let driver = Arc::clone(&self.driver);
        match check!(driver.find_one(cx, E::TABLE_NAME, &cond, self.tx).await) {
            Some(row) => {
                if let Some(entry) = self.identity.get_mut(key) {
                    ensure_ok!(entry.apply_row(&row));
                    entry.refresh_snapshot();
                }
                Outcome::Ok(())
            }
            None => Outcome::Err(Error::NotFound {
                table: E::TABLE_NAME,
            }),
        }
    }

    pub fn contains<E: Entity>(&self, handle: &Managed<E>) -> bool {
        self.identity.get(handle.key).is_some()
    }

    pub fn state_of(&self, key: ObjectKey) -> Option<EntityState> {
        self.identity.get(key).map(|e| e.state)
    }

    /// Stop tracking one entity. The live instance stays usable
    /// through existing handles but no longer takes part in flushes.
    pub fn detach<E: Entity>(&mut self, handle: &Managed<E>) {
        let key = self.identity.resolve(handle.key);
        self.identity.remove(key);
        self.pending_persist.retain(|k| *k != key);
        self.pending_remove.retain(|k| *k != key);
        self.pending_orphans.retain(|k| *k != key);
        self.pending_links.retain(|l| match l {
            PendingLink::SetForeignKey { entity, source, .. } => {
                *entity != key && *source != Some(key)
            }
            PendingLink::AddLinkRow { left, right, .. }
            | PendingLink::RemoveLinkRow { left, right, .. } => *left != key && *right != key,
        });
    }

    /// Stop tracking everything and drop all scheduled work.
    pub fn clear(&mut self) {
        self.identity.clear();
        self.pending_persist.clear();
        self.pending_remove.clear();
        self.pending_orphans.clear();
        self.pending_links.clear();
        self.evicted.clear();
    }

    /// Open an explicit transaction. Flushes inside it skip their own
    /// transaction handling.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.tx.is_some() {
            return Outcome::Err(TransactionError::already_active().into());
        }
        self.tx = Some(check!(self.driver.begin(cx, None).await));
        Outcome::Ok(())
    }

    /// Flush pending work, then commit the explicit transaction.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushReport, Error> {
        if self.tx.is_none() {
            return Outcome::Err(TransactionError::not_active().into());
        }
        let report = check!(self.flush(cx).await);
        if let Some(hook) = &self.events.before_commit {
            hook();
        }
        if let Some(token) = self.tx.take() {
            check!(self.driver.commit(cx, token).await);
        }
        if let Some(hook) = &self.events.after_commit {
            hook();
        }
        Outcome::Ok(report)
    }

    /// Roll back the explicit transaction.
    ///
    /// In-memory entities keep whatever state earlier flushes inside
    /// the transaction wrote back; refresh them if that matters.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let Some(token) = self.tx.take() else {
            return Outcome::Err(TransactionError::not_active().into());
        };
        check!(self.driver.rollback(cx, token).await);
        if let Some(hook) = &self.events.after_rollback {
            hook();
        }
        Outcome::Ok(())
    }

    /// A child context sharing this one's driver, snapshot plans,
    /// dependency graph and equality hooks, with its own identity map
    /// and scheduling state.
    pub fn fork(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            config: self.config,
            comparator: self.comparator.clone(),
            plans: self.plans.clone(),
            graph: self.graph.clone(),
            identity: IdentityMap::new(),
            pending_persist: Vec::new(),
            pending_remove: Vec::new(),
            pending_orphans: Vec::new(),
            pending_links: Vec::new(),
            evicted: Vec::new(),
            stage: FlushStage::default(),
            tx: None,
            events: ContextEvents::default(),
        }
    }

    /// Fold a forked context back in. On identity collisions the
    /// forked instance wins.
    pub fn merge(&mut self, fork: Context<D>) {
        if fork.tx.is_some() {
            tracing::warn!("merging a context with an open transaction; its token is dropped");
        }
        self.identity.absorb(fork.identity);
        self.pending_persist.extend(fork.pending_persist);
        self.pending_remove.extend(fork.pending_remove);
        self.pending_orphans.extend(fork.pending_orphans);
        self.pending_links.extend(fork.pending_links);
        self.evicted.extend(fork.evicted);
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self
                .identity
                .iter()
                .filter(|(_, e)| e.state == EntityState::New)
                .count(),
            removed: self.pending_remove.len() + self.pending_orphans.len(),
            links: self.pending_links.len(),
        }
    }

    /// Would any queued or unflushed change alter what a read of
    /// `table` returns?
    fn pending_change_targets(&self, table: &str) -> bool {
        let targets = |keys: &[ObjectKey], direction: Cascade| {
            cascade::expand(&self.identity, keys, direction)
                .iter()
                .any(|k| self.identity.get(*k).is_some_and(|e| e.table == table))
        };
        if targets(&self.pending_persist, Cascade::Persist) {
            return true;
        }
        let mut removals = self.pending_remove.clone();
        removals.extend_from_slice(&self.pending_orphans);
        if targets(&removals, Cascade::Remove) {
            return true;
        }
        if self.evicted.iter().any(|e| e.table == table) {
            return true;
        }
        for link in &self.pending_links {
            let touched = match link {
                PendingLink::SetForeignKey { entity, .. } => self
                    .identity
                    .get(self.identity.resolve(*entity))
                    .is_some_and(|e| e.table == table),
                PendingLink::AddLinkRow { link, .. }
                | PendingLink::RemoveLinkRow { link, .. } => link.table == table,
            };
            if touched {
                return true;
            }
        }
        // Dirty managed rows of the table count too.
        let builder = ChangeSetBuilder::new(&self.comparator);
        self.identity.iter().any(|(_, entry)| {
            entry.table == table
                && entry.state == EntityState::Managed
                && builder.update(entry).is_some()
        })
    }

    async fn auto_flush(&mut self, cx: &Cx, table: &str) -> Outcome<(), Error> {
        let should = match self.config.flush_mode {
            FlushMode::Always => true,
            FlushMode::Auto => self.pending_change_targets(table),
            FlushMode::Commit => false,
        };
        if should {
            check!(self.flush(cx).await);
        }
        Outcome::Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn track_row<E: Entity>(&mut self, row: &Row, plan: Arc<SnapshotPlan>) -> Result<Managed<E>> {
        let entity = E::from_row(row)?;
        let snapshot = plan.record(row);
        let reg = self
            .identity
            .register(entity, EntityState::Managed, Some(snapshot), plan);
        Ok(Managed {
            key: reg.key,
            handle: reg.handle,
        })
    }
}

impl<D: Driver> std::fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tracked", &self.identity.len())
            .field("stage", &self.stage)
            .field("in_tx", &self.tx.is_some())
            .finish_non_exhaustive()
    }
}
