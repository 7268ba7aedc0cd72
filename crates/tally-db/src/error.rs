//! # Database Error Types
//!
//! Error types for database operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)                                            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ├── is_transient() → retried by the sync engine's backoff        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SyncError (tally-sync) ← StorageUnavailable / DatabaseError           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Database operation errors.
///
/// These errors wrap sqlx errors and provide additional context
/// for debugging and for the retry decision upstream.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - A punch already stored under the same (serial, user, timestamp)
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation {
        field: String,
        value: String,
    },

    /// Foreign key constraint violation.
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation {
        message: String,
    },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be opened or created
    /// - Disk I/O error
    /// - Pool closed during shutdown
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The database is locked by another writer.
    ///
    /// ## When This Occurs
    /// - SQLITE_BUSY / SQLITE_LOCKED after the busy timeout elapsed
    /// - A read transaction could not be upgraded to a write (busy snapshot)
    #[error("Database busy: {0}")]
    Busy(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Request rejected before reaching SQLite.
    #[error("Invalid input: {0}")]
    Validation(#[from] tally_core::ValidationError),

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Returns true if retrying the same operation later may succeed.
    ///
    /// ## Transient
    /// - Connection failures (file I/O, closed pool)
    /// - Lock contention (`Busy`)
    /// - Pool exhaustion
    ///
    /// Constraint violations, bad SQL and missing rows are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionFailed(_) | DbError::Busy(_) | DbError::PoolExhausted
        )
    }

    /// Returns true for a unique constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DbError::UniqueViolation { .. })
    }
}

/// SQLite primary result codes that mean "try again later".
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Returns true if an extended SQLite result code reduces to BUSY or LOCKED.
fn is_lock_code(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Constraint kind, Busy, or QueryFailed
/// sqlx::Error::Io             → DbError::ConnectionFailed
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // SQLite messages for constraints:
                // UNIQUE constraint: "UNIQUE constraint failed: <table>.<column>, ..."
                // FK constraint: "FOREIGN KEY constraint failed"
                if db_err.is_unique_violation() || msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if db_err.is_foreign_key_violation()
                    || msg.contains("FOREIGN KEY constraint failed")
                {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else if db_err.code().as_deref().is_some_and(is_lock_code)
                    || msg.contains("database is locked")
                {
                    DbError::Busy(msg.to_string())
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::Io(io) => DbError::ConnectionFailed(io.to_string()),

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DbError::Busy("database is locked".into()).is_transient());
        assert!(DbError::PoolExhausted.is_transient());
        assert!(DbError::ConnectionFailed("disk I/O error".into()).is_transient());

        assert!(!DbError::duplicate("attendance_marks", "x").is_transient());
        assert!(!DbError::not_found("Queue item", "9").is_transient());
        assert!(!DbError::QueryFailed("syntax error".into()).is_transient());
    }

    #[test]
    fn test_lock_codes() {
        assert!(is_lock_code("5"));
        assert!(is_lock_code("6"));
        assert!(is_lock_code("517")); // SQLITE_BUSY_SNAPSHOT
        assert!(is_lock_code("262")); // SQLITE_LOCKED_SHAREDCACHE
        assert!(!is_lock_code("2067")); // SQLITE_CONSTRAINT_UNIQUE
        assert!(!is_lock_code("oops"));
    }
}
