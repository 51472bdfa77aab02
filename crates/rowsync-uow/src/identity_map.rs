//! Identity map and managed-entity bookkeeping.
//!
//! The identity map guarantees one live instance per (type, primary
//! key) within a context. Entities are stored behind `Arc<RwLock<E>>`
//! and type-erased; a small closure vtable captured at registration
//! lets the flush pipeline read rows, patch columns and write back
//! generated keys without knowing the concrete type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rowsync_core::{Entity, RelationMeta, Result, Row, Value, hash_values};

use crate::snapshot::{SnapshotPlan, SnapshotRecord};

/// Counter for keys of entities that have no primary key yet.
/// Process-wide so forked contexts never mint colliding keys.
static NEXT_TRANSIENT: AtomicU64 = AtomicU64::new(1);

/// Identity of a tracked entity within a context.
///
/// Entities with an assigned primary key are keyed by (type, pk hash)
/// and indexable. New entities without a key get a transient serial
/// until their insert completes, at which point the entry is promoted
/// to an assigned key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Assigned { type_id: TypeId, pk_hash: u64 },
    Transient { type_id: TypeId, serial: u64 },
}

impl ObjectKey {
    /// Key for an entity with a known primary key.
    pub fn assigned<E: Entity>(pk: &[Value]) -> Self {
        ObjectKey::Assigned {
            type_id: TypeId::of::<E>(),
            pk_hash: hash_values(pk),
        }
    }

    /// Fresh key for an entity awaiting its primary key.
    pub fn transient<E: Entity>() -> Self {
        ObjectKey::Transient {
            type_id: TypeId::of::<E>(),
            serial: NEXT_TRANSIENT.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            ObjectKey::Assigned { type_id, .. } | ObjectKey::Transient { type_id, .. } => *type_id,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ObjectKey::Transient { .. })
    }
}

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Scheduled for insert, not yet in the store
    New,
    /// Present in the store and tracked
    Managed,
    /// Scheduled for delete
    Removed,
    /// No longer tracked by any context
    Detached,
}

impl EntityState {
    pub fn is_tracked(&self) -> bool {
        !matches!(self, EntityState::Detached)
    }
}

/// Type-erased operations over a managed entity.
struct EntryOps {
    current_row: Box<dyn Fn() -> Row + Send + Sync>,
    primary_key: Box<dyn Fn() -> Vec<Value> + Send + Sync>,
    apply_row: Box<dyn Fn(&Row) -> Result<()> + Send + Sync>,
    set_generated_key: Box<dyn Fn(Value) + Send + Sync>,
    version_value: Box<dyn Fn() -> Option<Value> + Send + Sync>,
}

/// Side-table record for one managed entity.
///
/// Tracking state lives here, never on the entity itself.
pub struct ManagedEntry {
    pub key: ObjectKey,
    pub table: &'static str,
    pub schema: Option<&'static str>,
    pub state: EntityState,
    /// Snapshot taken at load or after the last successful flush.
    /// `None` for entities that have never been written.
    pub snapshot: Option<SnapshotRecord>,
    /// Emit a version bump on the next flush even when clean
    pub force_version_bump: bool,
    pub plan: Arc<SnapshotPlan>,
    relations: &'static [RelationMeta],
    handle: Box<dyn Any + Send + Sync>,
    ops: EntryOps,
}

impl ManagedEntry {
    fn new<E: Entity>(
        key: ObjectKey,
        state: EntityState,
        snapshot: Option<SnapshotRecord>,
        plan: Arc<SnapshotPlan>,
        handle: Arc<RwLock<E>>,
    ) -> Self {
        let ops = EntryOps {
            current_row: {
                let h = Arc::clone(&handle);
                Box::new(move || h.read().expect("entity lock poisoned").to_row())
            },
            primary_key: {
                let h = Arc::clone(&handle);
                Box::new(move || h.read().expect("entity lock poisoned").primary_key())
            },
            apply_row: {
                let h = Arc::clone(&handle);
                Box::new(move |row| h.write().expect("entity lock poisoned").apply_row(row))
            },
            set_generated_key: {
                let h = Arc::clone(&handle);
                Box::new(move |value| {
                    h.write()
                        .expect("entity lock poisoned")
                        .set_generated_key(value);
                })
            },
            version_value: {
                let h = Arc::clone(&handle);
                Box::new(move || h.read().expect("entity lock poisoned").version_value())
            },
        };
        Self {
            key,
            table: E::TABLE_NAME,
            schema: E::SCHEMA,
            state,
            snapshot,
            force_version_bump: false,
            plan,
            relations: E::relations(),
            handle: Box::new(handle),
            ops,
        }
    }

    /// Current row of the live entity.
    pub fn current_row(&self) -> Row {
        (self.ops.current_row)()
    }

    /// Current primary key values of the live entity.
    pub fn primary_key(&self) -> Vec<Value> {
        (self.ops.primary_key)()
    }

    /// Merge columns into the live entity.
    #[allow(clippy::result_large_err)]
    pub fn apply_row(&self, row: &Row) -> Result<()> {
        (self.ops.apply_row)(row)
    }

    /// Write back a store-generated key.
    pub fn set_generated_key(&self, value: Value) {
        (self.ops.set_generated_key)(value);
    }

    /// Current version column value of the live entity.
    pub fn version_value(&self) -> Option<Value> {
        (self.ops.version_value)()
    }

    pub fn relations(&self) -> &'static [RelationMeta] {
        self.relations
    }

    /// Take a fresh snapshot of the live entity and store it.
    pub fn refresh_snapshot(&mut self) {
        self.snapshot = Some(self.plan.record(&self.current_row()));
    }

    /// Equality condition for this entity's primary key columns.
    #[allow(clippy::result_large_err)]
    pub fn pk_cond(&self) -> Result<Vec<(&'static str, Value)>> {
        let values = self.primary_key();
        if values.iter().any(Value::is_null) {
            return Err(rowsync_core::ValidationError::missing_primary_key(self.table).into());
        }
        Ok(self
            .plan
            .pk_columns
            .iter()
            .copied()
            .zip(values)
            .collect())
    }

    fn typed_handle<E: Entity>(&self) -> Option<Arc<RwLock<E>>> {
        self.handle.downcast_ref::<Arc<RwLock<E>>>().cloned()
    }
}

impl std::fmt::Debug for ManagedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedEntry")
            .field("key", &self.key)
            .field("table", &self.table)
            .field("state", &self.state)
            .field("has_snapshot", &self.snapshot.is_some())
            .finish_non_exhaustive()
    }
}

/// What `IdentityMap::register` did.
pub struct Registration<E> {
    pub key: ObjectKey,
    pub handle: Arc<RwLock<E>>,
    /// The key was already present; the existing instance won and the
    /// offered entity was dropped.
    pub existed: bool,
}

/// The identity map: one entry per tracked entity.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, ManagedEntry>,
    /// Transient keys that have been promoted, so stale handles still
    /// resolve to the assigned entry.
    aliases: HashMap<ObjectKey, ObjectKey>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow promotion aliases to the canonical key.
    pub fn resolve(&self, key: ObjectKey) -> ObjectKey {
        let mut current = key;
        while let Some(next) = self.aliases.get(&current) {
            current = *next;
        }
        current
    }

    /// Register an entity, taking ownership.
    ///
    /// Idempotent per identity: if an entry with the same assigned key
    /// already exists, the existing instance wins and is returned.
    /// Entities without a primary key get a transient key and are not
    /// reachable through [`IdentityMap::by_pk`] until promoted.
    pub fn register<E: Entity>(
        &mut self,
        entity: E,
        state: EntityState,
        snapshot: Option<SnapshotRecord>,
        plan: Arc<SnapshotPlan>,
    ) -> Registration<E> {
        let pk = entity.primary_key();
        let key = if pk.is_empty() || pk.iter().any(Value::is_null) {
            ObjectKey::transient::<E>()
        } else {
            ObjectKey::assigned::<E>(&pk)
        };

        if let Some(existing) = self.entries.get(&key) {
            if let Some(handle) = existing.typed_handle::<E>() {
                return Registration {
                    key,
                    handle,
                    existed: true,
                };
            }
        }

        let handle = Arc::new(RwLock::new(entity));
        let entry = ManagedEntry::new(key, state, snapshot, plan, Arc::clone(&handle));
        self.entries.insert(key, entry);
        Registration {
            key,
            handle,
            existed: false,
        }
    }

    /// Look up an entry by key, following aliases.
    pub fn get(&self, key: ObjectKey) -> Option<&ManagedEntry> {
        self.entries.get(&self.resolve(key))
    }

    pub fn get_mut(&mut self, key: ObjectKey) -> Option<&mut ManagedEntry> {
        let key = self.resolve(key);
        self.entries.get_mut(&key)
    }

    /// Typed handle for a key, if present and of the right type.
    pub fn handle_of<E: Entity>(&self, key: ObjectKey) -> Option<Arc<RwLock<E>>> {
        self.get(key).and_then(ManagedEntry::typed_handle)
    }

    /// Look up a tracked entity of type `E` by primary key.
    pub fn by_pk<E: Entity>(&self, pk: &[Value]) -> Option<&ManagedEntry> {
        self.entries.get(&ObjectKey::assigned::<E>(pk))
    }

    /// Promote a transient entry to its assigned key once the primary
    /// key is known. A no-op for already-assigned keys.
    pub fn promote(&mut self, key: ObjectKey) -> ObjectKey {
        let key = self.resolve(key);
        if !key.is_transient() {
            return key;
        }
        let Some(mut entry) = self.entries.remove(&key) else {
            return key;
        };
        let pk = entry.primary_key();
        let assigned = ObjectKey::Assigned {
            type_id: key.type_id(),
            pk_hash: hash_values(&pk),
        };
        entry.key = assigned;
        self.aliases.insert(key, assigned);
        self.entries.insert(assigned, entry);
        assigned
    }

    /// Drop an entry, returning it.
    pub fn remove(&mut self, key: ObjectKey) -> Option<ManagedEntry> {
        let key = self.resolve(key);
        self.entries.remove(&key)
    }

    /// Tracked entries of `table` whose `fk_column` currently equals
    /// `parent_pk`. Used for cascade expansion.
    pub fn find_children(
        &self,
        table: &str,
        fk_column: &str,
        parent_pk: &Value,
    ) -> Vec<ObjectKey> {
        let parent_hash = hash_values(std::slice::from_ref(parent_pk));
        let mut keys: Vec<ObjectKey> = self
            .entries
            .values()
            .filter(|e| e.table == table && e.state.is_tracked())
            .filter(|e| {
                e.current_row()
                    .get_by_name(fk_column)
                    .is_some_and(|v| {
                        !v.is_null() && hash_values(std::slice::from_ref(v)) == parent_hash
                    })
            })
            .map(|e| e.key)
            .collect();
        keys.sort_by_key(|k| match k {
            ObjectKey::Assigned { pk_hash, .. } => (0u8, *pk_hash),
            ObjectKey::Transient { serial, .. } => (1u8, *serial),
        });
        keys
    }

    /// Tracked entry of `table` with the given primary key, if any.
    pub fn find_by_table_pk(&self, table: &str, pk: &[Value]) -> Option<ObjectKey> {
        let pk_hash = hash_values(pk);
        self.entries
            .values()
            .find(|e| {
                e.table == table
                    && e.state.is_tracked()
                    && hash_values(&e.primary_key()) == pk_hash
            })
            .map(|e| e.key)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &ManagedEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.aliases.clear();
    }

    /// Move every entry of `other` into this map.
    ///
    /// On colliding keys the merged-in side's state wins, but the
    /// existing live instance is kept and updated in place, so handles
    /// callers already hold stay valid.
    pub fn absorb(&mut self, other: IdentityMap) {
        for (key, entry) in other.entries {
            match self.entries.get_mut(&key) {
                Some(existing) => {
                    // Equal keys imply the same entity type.
                    let _ = existing.apply_row(&entry.current_row());
                    existing.snapshot = entry.snapshot;
                    existing.state = entry.state;
                    existing.force_version_bump = entry.force_version_bump;
                }
                None => {
                    self.entries.insert(key, entry);
                }
            }
        }
        self.aliases.extend(other.aliases);
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("entries", &self.entries.len())
            .field("aliases", &self.aliases.len())
            .finish()
    }
}
