//! rowsync - consistency tracking for object persistence.
//!
//! rowsync keeps in-memory entities and their stored rows consistent
//! through a unit of work:
//!
//! - Identity map: one live instance per (type, primary key)
//! - Snapshot dirty checking with minimal update payloads
//! - Dependency-ordered flush with cycle splitting
//! - Persist/remove cascades and orphan removal
//! - Optimistic versioning and pessimistic row locks
//! - Context forking for concurrent loading
//!
//! # Quick Start
//!
//! ```ignore
//! use rowsync::prelude::*;
//!
//! async fn example(cx: &Cx, driver: impl Driver) -> Result<()> {
//!     let mut ctx = Context::new(driver);
//!
//!     // Track and insert
//!     let team = ctx.persist(Team::new("Avengers"));
//!     let hero = ctx.persist(Hero::new("Iron Man"));
//!     ctx.link(&hero, "team", &team)?;
//!     ctx.flush(cx).await.into_result()?;
//!
//!     // Mutate; the next flush writes only what changed
//!     hero.write().name = "Tony Stark".to_string();
//!     ctx.flush(cx).await.into_result()?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Storage is abstracted behind [`Driver`]; the unit of work issues
//! structural operations (find, insert, update, delete) and never
//! renders SQL itself.

// Re-export all public types from sub-crates
pub use rowsync_core::{
    // asupersync re-exports
    Budget,
    ColumnSet,
    Cond,
    // Core types
    Cx,
    Driver,
    DriverError,
    Entity,
    Error,
    ExecResult,
    FieldMeta,
    FromValue,
    LinkMeta,
    LockFailedError,
    LockWait,
    OptimisticLockError,
    Outcome,
    RegionId,
    RelationKind,
    RelationMeta,
    Result,
    Row,
    RowLock,
    TaskId,
    TransactionError,
    TransactionErrorKind,
    TxToken,
    TypeError,
    ValidationError,
    ValidationErrorKind,
    Value,
    hash_value,
    hash_values,
};

pub use rowsync_uow::{
    Cascade, ChangeKind, ChangeSet, ChangeSetBuilder, CommitOrder, Comparator, Context,
    ContextConfig, ContextEvents, DependencyGraph, EntityState, FieldChange, FlushMode,
    FlushReport, FlushStage, IdentityMap, LockMode, Managed, ManagedEntry, ObjectKey,
    PendingCounts, Registration, SnapshotPlan, SnapshotPlans, SnapshotRecord, semantic_eq,
};

/// Everything a typical caller needs.
pub mod prelude {
    pub use crate::{
        Context, Cx, Driver, Entity, Error, FieldMeta, FlushMode, LinkMeta, LockMode, Managed,
        Outcome, RelationKind, RelationMeta, Result, Row, Value,
    };
}
