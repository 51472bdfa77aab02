//! Core types and traits for rowsync.
//!
//! This crate provides the foundational abstractions the unit of work
//! is built on:
//!
//! - `Entity` trait for struct <-> row mapping with const metadata
//! - `FieldMeta` / `RelationMeta` describing columns and relations
//! - `Driver` trait for storage backends
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod entity;
pub mod error;
pub mod meta;
pub mod row;
pub mod value;

pub use driver::{Cond, Driver, ExecResult, LockWait, RowLock, TxToken};
pub use entity::Entity;
pub use error::{
    DriverError, Error, LockFailedError, OptimisticLockError, Result, TransactionError,
    TransactionErrorKind, TypeError, ValidationError, ValidationErrorKind,
};
pub use meta::{FieldMeta, LinkMeta, RelationKind, RelationMeta};
pub use row::{ColumnSet, FromValue, Row};
pub use value::{Value, hash_value, hash_values};
