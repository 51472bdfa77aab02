//! Field and relation metadata.
//!
//! Entities describe themselves through const tables of [`FieldMeta`]
//! and [`RelationMeta`]. The unit of work drives snapshots, diffing,
//! commit ordering and cascades off this metadata alone, without ever
//! knowing the concrete entity type.

/// Metadata about one persistent field of an entity.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    /// Rust field name
    pub name: &'static str,
    /// Column name (may differ from field name)
    pub column: &'static str,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is part of the primary key
    pub primary_key: bool,
    /// Whether the store generates the value on insert
    pub generated: bool,
    /// Whether this is the optimistic version column
    pub version: bool,
    /// Whether the value is an embedded composite, snapshotted
    /// field-by-field under dotted paths
    pub composite: bool,
    /// Foreign key reference as "table.column"
    pub foreign_key: Option<&'static str>,
    /// Name of a registered equality hook overriding value comparison
    pub equality_hook: Option<&'static str>,
}

impl FieldMeta {
    /// Create a new field with minimal required data.
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            nullable: false,
            primary_key: false,
            generated: false,
            version: false,
            composite: false,
            foreign_key: None,
            equality_hook: None,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Mark the value as store-generated (auto-increment or similar).
    /// Generated columns are left out of INSERT payloads and written
    /// back after the insert completes.
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Mark this as the optimistic version column.
    pub const fn version(mut self) -> Self {
        self.version = true;
        self
    }

    /// Mark the value as an embedded composite.
    pub const fn composite(mut self) -> Self {
        self.composite = true;
        self
    }

    /// Declare a foreign key reference as "table.column".
    pub const fn foreign_key(mut self, target: &'static str) -> Self {
        self.foreign_key = Some(target);
        self
    }

    /// Override comparison for this field with a named equality hook.
    pub const fn equality_hook(mut self, hook: &'static str) -> Self {
        self.equality_hook = Some(hook);
        self
    }

    /// The referenced table, if this field is a foreign key.
    pub fn foreign_table(&self) -> Option<&'static str> {
        self.foreign_key
            .map(|fk| fk.split('.').next().unwrap_or(fk))
    }
}

/// The shape of a relation between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// One row on each side, foreign key on the owning side
    OneToOne,
    /// Many rows here reference one row there
    ManyToOne,
    /// Inverse of ManyToOne
    OneToMany,
    /// Link table between the two sides
    ManyToMany,
}

impl RelationKind {
    /// Does this side's table carry the foreign key column?
    pub const fn owns_foreign_key(&self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOne)
    }

    /// Is the far side a collection?
    pub const fn is_collection(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Link table metadata for many-to-many relations.
#[derive(Debug, Clone, Copy)]
pub struct LinkMeta {
    /// The link table name
    pub table: &'static str,
    /// Column referencing this side
    pub local_column: &'static str,
    /// Column referencing the far side
    pub remote_column: &'static str,
}

/// Metadata about one relation of an entity.
#[derive(Debug, Clone)]
pub struct RelationMeta {
    /// Relation name on the entity
    pub name: &'static str,
    /// Relation shape
    pub kind: RelationKind,
    /// Table of the far side
    pub target_table: &'static str,
    /// Column on the owning side holding the foreign key.
    /// For OneToMany this names the column on the far table.
    pub fk_column: &'static str,
    /// Link table, only for ManyToMany
    pub link: Option<LinkMeta>,
    /// Persisting this entity also schedules reachable targets
    pub cascade_persist: bool,
    /// Removing this entity also schedules reachable targets
    pub cascade_remove: bool,
    /// Targets disconnected from this side are removed at flush
    pub orphan_removal: bool,
}

impl RelationMeta {
    /// Create a new relation with minimal required data.
    pub const fn new(
        name: &'static str,
        kind: RelationKind,
        target_table: &'static str,
        fk_column: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            target_table,
            fk_column,
            link: None,
            cascade_persist: false,
            cascade_remove: false,
            orphan_removal: false,
        }
    }

    pub const fn link(mut self, link: LinkMeta) -> Self {
        self.link = Some(link);
        self
    }

    pub const fn cascade_persist(mut self) -> Self {
        self.cascade_persist = true;
        self
    }

    pub const fn cascade_remove(mut self) -> Self {
        self.cascade_remove = true;
        self
    }

    /// Orphan removal implies cascade remove for disconnected targets.
    pub const fn orphan_removal(mut self) -> Self {
        self.orphan_removal = true;
        self
    }
}
