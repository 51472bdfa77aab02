//! Entity-level locking.
//!
//! Optimistic locking rides on the version column: versioned updates
//! and deletes carry an expected-version condition, and zero affected
//! rows means someone else won. Pessimistic locking asks the driver
//! for a row lock and requires an active transaction.

use asupersync::{Cx, Outcome};
use rowsync_core::{
    Driver, Entity, Error, ExecResult, LockFailedError, LockWait, OptimisticLockError, Result,
    RowLock, TransactionError, ValidationError, Value,
};

use crate::comparator::semantic_eq;
use crate::{Context, Managed};

/// How to lock an entity via [`Context::lock`].
#[derive(Debug, Clone, PartialEq)]
pub enum LockMode {
    /// Verify the version column, optionally against an expected
    /// value, without touching the store.
    Optimistic(Option<Value>),
    /// Force a version bump on the next flush even if the entity is
    /// otherwise clean.
    OptimisticForce,
    /// Shared row lock in the current transaction.
    PessimisticRead(LockWait),
    /// Exclusive row lock in the current transaction.
    PessimisticWrite(LockWait),
}

/// Check the outcome of a versioned write.
///
/// A versioned UPDATE or DELETE that affected no rows lost the race:
/// the row was changed or removed since its snapshot was taken.
#[allow(clippy::result_large_err)]
pub(crate) fn verify_versioned_write(
    table: &'static str,
    primary_key: Vec<Value>,
    version_check: Option<&(&'static str, Value)>,
    result: &ExecResult,
) -> Result<()> {
    if let Some((_, expected)) = version_check {
        if result.rows_affected == 0 {
            return Err(Error::OptimisticLock(OptimisticLockError {
                table,
                primary_key,
                expected_version: Some(expected.clone()),
            }));
        }
    }
    Ok(())
}

impl<D: Driver> Context<D> {
    /// Lock a managed entity.
    ///
    /// Pessimistic modes require [`Context::begin`] to have been
    /// called; the lock is held until that transaction ends.
    #[tracing::instrument(level = "debug", skip(self, cx, handle), fields(table = E::TABLE_NAME))]
    pub async fn lock<E: Entity>(
        &mut self,
        cx: &Cx,
        handle: &Managed<E>,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        let key = self.identity.resolve(handle.key());
        if self.identity.get(key).is_none() {
            return Outcome::Err(ValidationError::not_managed(E::TABLE_NAME).into());
        }

        let exclusive = matches!(&mode, LockMode::PessimisticWrite(_));
        match mode {
            LockMode::Optimistic(expected) => {
                let entry = self.identity.get(key).expect("entry checked above");
                if entry.plan.version_column.is_none() {
                    return Outcome::Err(ValidationError::not_versioned(entry.table).into());
                }
                if let Some(expected) = expected {
                    let current = entry.version_value().unwrap_or(Value::Null);
                    if !semantic_eq(&current, &expected) {
                        return Outcome::Err(Error::OptimisticLock(OptimisticLockError {
                            table: entry.table,
                            primary_key: entry.primary_key(),
                            expected_version: Some(expected),
                        }));
                    }
                }
                Outcome::Ok(())
            }
            LockMode::OptimisticForce => {
                let entry = self.identity.get_mut(key).expect("entry checked above");
                if entry.plan.version_column.is_none() {
                    return Outcome::Err(ValidationError::not_versioned(entry.table).into());
                }
                entry.force_version_bump = true;
                Outcome::Ok(())
            }
            LockMode::PessimisticRead(wait) | LockMode::PessimisticWrite(wait) => {
                if self.tx.is_none() {
                    return Outcome::Err(TransactionError::required("pessimistic lock").into());
                }
                let entry = self.identity.get(key).expect("entry checked above");
                let cond = match entry.pk_cond() {
                    Ok(cond) => cond,
                    Err(e) => return Outcome::Err(e),
                };
                let strength = if exclusive {
                    RowLock::Exclusive
                } else {
                    RowLock::Shared
                };
                match self
                    .driver
                    .acquire_lock(cx, entry.table, &cond, strength, wait, self.tx)
                    .await
                {
                    Outcome::Ok(result) if result.rows_affected == 0 => {
                        Outcome::Err(Error::LockFailed(LockFailedError {
                            table: entry.table,
                            primary_key: entry.primary_key(),
                        }))
                    }
                    Outcome::Ok(_) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(c) => Outcome::Cancelled(c),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }
}
