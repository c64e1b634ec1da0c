//! Error taxonomy surfaced by the store.
//!
//! Every fallible operation returns `Result<T, StoreError>`. Four kinds matter to
//! callers (not-found, illegal-transition, conflict, busy); everything else is
//! folded into `Internal` with the originating operation name attached so logs
//! can be correlated without leaking row content.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{op}: not found")]
    NotFound { op: &'static str },

    #[error("{op}: illegal transition from {from} to {to}")]
    IllegalTransition {
        op: &'static str,
        from: String,
        to: String,
    },

    #[error("{op}: conflict: {message}")]
    Conflict { op: &'static str, message: String },

    #[error("{op}: database busy after {attempts} attempts")]
    Busy { op: &'static str, attempts: u32 },

    #[error("{op}: cancelled")]
    Cancelled { op: &'static str },

    #[error("{op}: db schema version {found} is newer than supported {supported}")]
    SchemaTooNew { op: &'static str, found: i64, supported: i64 },

    #[error("{op}: schema checksum mismatch for version {version}")]
    SchemaChecksumMismatch { op: &'static str, version: i64 },

    #[error("{op}: internal error: {source}")]
    Internal {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub fn internal(op: &'static str, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Internal {
            op,
            source: source.into(),
        }
    }

    pub fn not_found(op: &'static str) -> Self {
        StoreError::NotFound { op }
    }

    pub fn conflict(op: &'static str, message: impl Into<String>) -> Self {
        StoreError::Conflict {
            op,
            message: message.into(),
        }
    }

    /// True when this error should be retried by the busy-retry wrapper.
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Busy { .. })
    }
}

/// Classifies a raw `rusqlite::Error` as busy/locked using the driver's
/// structured error code first, falling back to substring matching on the
/// text for errors that don't carry one (e.g. already-wrapped errors).
pub fn is_busy_sqlite_error(err: &rusqlite::Error) -> bool {
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = err {
        use rusqlite::ErrorCode::*;
        if matches!(ffi_err.code, DatabaseBusy | DatabaseLocked) {
            return true;
        }
    }
    let text = err.to_string();
    text.contains("database is locked")
        || text.contains("database table is locked")
        || text.contains(" (5)")
        || text.contains(" (6)")
}

pub(crate) fn from_sqlite(op: &'static str, err: rusqlite::Error) -> StoreError {
    if is_busy_sqlite_error(&err) {
        return StoreError::Busy { op, attempts: 0 };
    }
    if let rusqlite::Error::SqliteFailure(ffi_err, ref msg) = err {
        if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict {
                op,
                message: msg.clone().unwrap_or_else(|| err.to_string()),
            };
        }
    }
    StoreError::Internal {
        op,
        source: anyhow::Error::new(err),
    }
}
