use std::fmt;

use backtrace::Backtrace;
use thiserror::Error;

/// The error kinds enumerated in the cache's error-handling design:
/// pool exhaustion/shutdown, SQLite contention, a missing blob, a short
/// read, schema/pragma failures, and batch-transaction unwind failures.
#[derive(Debug, Error)]
pub enum StorageErrorKind {
    #[error("connection pool is closed or exhausted")]
    PoolClosed,

    #[error("database is busy")]
    Busy,

    #[error("blob not found: {}", _0)]
    NotFound(String),

    #[error("end of blob reached")]
    Eof,

    #[error("schema or pragma initialization failed: {}", _0)]
    Schema(String),

    #[error("batch transaction savepoint failed to unwind: {}", _0)]
    BatchTransaction(String),

    #[error("sqlite error: {}", _0)]
    Sqlite(#[from] rusqlite::Error),

    #[error("pool error: {}", _0)]
    Pool(#[from] r2d2::Error),

    #[error("{}", _0)]
    Internal(String),
}

/// Wraps a [`StorageErrorKind`] with a captured backtrace, mirroring
/// `syncserver_db_common::error::DbError`'s split between the matchable
/// kind and the diagnostic context callers don't usually need to see.
#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub backtrace: Backtrace,
}

impl StorageError {
    pub fn internal(msg: impl Into<String>) -> Self {
        StorageErrorKind::Internal(msg.into()).into()
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        StorageErrorKind::NotFound(name.into()).into()
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(inner: rusqlite::Error) -> StorageError {
        StorageErrorKind::from(inner).into()
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(inner: r2d2::Error) -> StorageError {
        StorageErrorKind::from(inner).into()
    }
}

impl From<StorageErrorKind> for StorageError {
    fn from(kind: StorageErrorKind) -> StorageError {
        StorageError {
            kind,
            backtrace: Backtrace::new(),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Lets callers branch on error kind without matching `StorageErrorKind`
/// directly, the way `DbErrorIntrospect` lets `syncstorage` callers do.
pub trait StorageErrorIntrospect {
    fn is_not_found(&self) -> bool;
    fn is_busy(&self) -> bool;
    fn is_eof(&self) -> bool;
    fn is_pool_closed(&self) -> bool;
    fn metric_label(&self) -> Option<String>;
}

impl StorageErrorIntrospect for StorageError {
    fn is_not_found(&self) -> bool {
        matches!(self.kind, StorageErrorKind::NotFound(_))
    }

    fn is_busy(&self) -> bool {
        match &self.kind {
            StorageErrorKind::Busy => true,
            StorageErrorKind::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            _ => false,
        }
    }

    fn is_eof(&self) -> bool {
        matches!(self.kind, StorageErrorKind::Eof)
    }

    fn is_pool_closed(&self) -> bool {
        matches!(self.kind, StorageErrorKind::PoolClosed)
    }

    fn metric_label(&self) -> Option<String> {
        match &self.kind {
            StorageErrorKind::Busy => Some("storage.busy".to_owned()),
            StorageErrorKind::NotFound(_) => Some("storage.not_found".to_owned()),
            StorageErrorKind::BatchTransaction(_) => Some("storage.batch_error".to_owned()),
            _ => None,
        }
    }
}
