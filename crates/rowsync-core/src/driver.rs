//! Storage driver abstraction.
//!
//! The unit of work talks to storage exclusively through [`Driver`].
//! Operations are structural (table, columns, values, conditions), so
//! a driver may render SQL, speak a wire protocol, or sit over an in-
//! memory store in tests. All operations take a `Cx` context and
//! return `Outcome` for asupersync cancellation semantics.

use asupersync::{Cx, Outcome};

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;

/// An equality condition: column = value. Multi-column conditions are
/// conjunctions.
pub type Cond = (&'static str, Value);

/// Handle for an open transaction.
///
/// Opaque to the unit of work; drivers mint them in [`Driver::begin`]
/// and resolve them in commit/rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxToken(pub u64);

/// Result of a write operation.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Number of rows the statement affected
    pub rows_affected: u64,
    /// Store-generated key of the last inserted row, if any
    pub insert_id: Option<i64>,
}

impl ExecResult {
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            insert_id: None,
        }
    }

    pub fn with_insert_id(rows_affected: u64, insert_id: i64) -> Self {
        Self {
            rows_affected,
            insert_id: Some(insert_id),
        }
    }
}

/// Row lock strength for pessimistic locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLock {
    /// Shared read lock (FOR SHARE or equivalent)
    Shared,
    /// Exclusive write lock (FOR UPDATE or equivalent)
    Exclusive,
}

/// What to do when a requested row lock is already held elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    /// Block until the lock becomes available
    #[default]
    Block,
    /// Fail immediately (NOWAIT or equivalent)
    Fail,
    /// Skip the contended row (SKIP LOCKED or equivalent)
    SkipLocked,
}

/// A storage backend.
///
/// Implementations must not interpret ordering: the unit of work issues
/// operations in an order that already satisfies foreign key
/// dependencies, and drivers execute them as given. Every data
/// operation carries the transaction it runs under as `tx`; `None`
/// means autocommit. The same driver instance may serve several
/// contexts at once (see `fork`), so the token is how a driver
/// attributes an operation to the right transaction.
pub trait Driver: Send + Sync + 'static {
    /// Fetch all rows matching the condition.
    fn find(
        &self,
        cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Fetch the first row matching the condition, if any.
    fn find_one(
        &self,
        cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Insert one row.
    fn insert(
        &self,
        cx: &Cx,
        table: &'static str,
        columns: &[&'static str],
        values: Vec<Value>,
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Insert several rows sharing the same column list.
    ///
    /// `insert_id` of the result refers to the last row inserted.
    fn insert_many(
        &self,
        cx: &Cx,
        table: &'static str,
        columns: &[&'static str],
        rows: Vec<Vec<Value>>,
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Update rows matching the condition.
    fn update(
        &self,
        cx: &Cx,
        table: &'static str,
        set: &[Cond],
        cond: &[Cond],
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Delete rows matching the condition.
    fn delete(
        &self,
        cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Acquire a row lock inside the transaction identified by `tx`.
    ///
    /// `rows_affected` of 0 means the row was contended and skipped
    /// (only possible with [`LockWait::SkipLocked`]); drivers report
    /// `LockWait::Fail` contention as an error.
    fn acquire_lock(
        &self,
        cx: &Cx,
        table: &'static str,
        cond: &[Cond],
        lock: RowLock,
        wait: LockWait,
        tx: Option<TxToken>,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send;

    /// Open a transaction.
    ///
    /// A `parent` token asks for a transaction nested under it;
    /// drivers without nesting support (savepoints or equivalent)
    /// reject the request with a transaction error.
    fn begin(
        &self,
        cx: &Cx,
        parent: Option<TxToken>,
    ) -> impl Future<Output = Outcome<TxToken, Error>> + Send;

    /// Commit the transaction identified by `tx`.
    fn commit(&self, cx: &Cx, tx: TxToken) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the transaction identified by `tx`.
    fn rollback(&self, cx: &Cx, tx: TxToken) -> impl Future<Output = Outcome<(), Error>> + Send;
}
