//! Error types for unit-of-work operations.

use std::fmt;

use crate::value::Value;

/// The primary error type for all rowsync operations.
#[derive(Debug)]
pub enum Error {
    /// API misuse detected before any driver work happened
    Validation(ValidationError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// A versioned update or remove matched no row
    OptimisticLock(OptimisticLockError),
    /// A pessimistic lock could not be acquired
    LockFailed(LockFailedError),
    /// A strict read matched no row
    NotFound { table: &'static str },
    /// Error reported by the driver
    Driver(DriverError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// API misuse: the caller handed the unit of work something it cannot
/// track, or called an operation in the wrong state.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// The entity is not managed by this context
    NotManaged,
    /// A managed entity is missing its primary key where one is required
    MissingPrimaryKey,
    /// flush() was entered while a flush is already running
    ReentrantFlush,
    /// Named relation does not exist on the entity
    UnknownRelation,
    /// Named field does not exist on the entity
    UnknownField,
    /// Operation requires a version column the entity does not have
    NotVersioned,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_managed(table: &str) -> Self {
        Self::new(
            ValidationErrorKind::NotManaged,
            format!("entity of table '{table}' is not managed by this context"),
        )
    }

    pub fn missing_primary_key(table: &str) -> Self {
        Self::new(
            ValidationErrorKind::MissingPrimaryKey,
            format!("entity of table '{table}' has no primary key value"),
        )
    }

    pub fn reentrant_flush() -> Self {
        Self::new(
            ValidationErrorKind::ReentrantFlush,
            "flush() called while a flush is already in progress",
        )
    }

    pub fn unknown_relation(table: &str, relation: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownRelation,
            format!("table '{table}' has no relation '{relation}'"),
        )
    }

    pub fn not_versioned(table: &str) -> Self {
        Self::new(
            ValidationErrorKind::NotVersioned,
            format!("table '{table}' has no version column"),
        )
    }

    pub fn unknown_field(table: &str, field: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownField,
            format!("table '{table}' has no field '{field}'"),
        )
    }
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already active on this context
    AlreadyActive,
    /// Operation requires an active transaction
    Required,
}

impl TransactionError {
    pub fn new(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn required(operation: &str) -> Self {
        Self::new(
            TransactionErrorKind::Required,
            format!("{operation} requires an active transaction"),
        )
    }

    pub fn not_active() -> Self {
        Self::new(TransactionErrorKind::NotActive, "no active transaction")
    }

    pub fn already_active() -> Self {
        Self::new(
            TransactionErrorKind::AlreadyActive,
            "a transaction is already active",
        )
    }
}

/// A versioned write observed zero affected rows: the row was changed
/// or deleted by someone else since it was loaded.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub table: &'static str,
    pub primary_key: Vec<Value>,
    pub expected_version: Option<Value>,
}

/// A pessimistic row lock was requested with `LockWait::Fail` or
/// `LockWait::SkipLocked` and the row was already held.
#[derive(Debug, Clone)]
pub struct LockFailedError {
    pub table: &'static str,
    pub primary_key: Vec<Value>,
}

/// Error bubbled up from a driver implementation.
#[derive(Debug)]
pub struct DriverError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }
}

impl Error {
    /// Is this a conflict the caller may resolve by reloading and retrying?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::OptimisticLock(_) | Error::LockFailed(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e.message),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::OptimisticLock(e) => write!(
                f,
                "Optimistic lock failure on '{}': row changed or deleted since load",
                e.table
            ),
            Error::LockFailed(e) => {
                write!(f, "Could not acquire row lock on '{}'", e.table)
            }
            Error::NotFound { table } => write!(f, "No row found in '{}'", table),
            Error::Driver(e) => write!(f, "Driver error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

impl From<TransactionError> for Error {
    fn from(e: TransactionError) -> Self {
        Error::Transaction(e)
    }
}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        Error::Driver(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = Error::Validation(ValidationError::not_managed("hero"));
        assert!(err.to_string().contains("hero"));
        assert!(err.to_string().contains("not managed"));
    }

    #[test]
    fn test_optimistic_lock_display() {
        let err = Error::OptimisticLock(OptimisticLockError {
            table: "hero",
            primary_key: vec![Value::BigInt(1)],
            expected_version: Some(Value::BigInt(3)),
        });
        let msg = err.to_string();
        assert!(msg.contains("Optimistic lock"));
        assert!(msg.contains("hero"));
    }

    #[test]
    fn test_is_conflict() {
        let lock = Error::OptimisticLock(OptimisticLockError {
            table: "t",
            primary_key: vec![],
            expected_version: None,
        });
        assert!(lock.is_conflict());

        let not_found = Error::NotFound { table: "t" };
        assert!(!not_found.is_conflict());
    }

    #[test]
    fn test_transaction_required() {
        let err: Error = TransactionError::required("pessimistic lock").into();
        assert!(err.to_string().contains("requires an active transaction"));
    }

    #[test]
    fn test_driver_error_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = Error::Driver(DriverError {
            message: "write failed".to_string(),
            source: Some(Box::new(io)),
        });
        assert!(err.source().is_some());
    }
}
