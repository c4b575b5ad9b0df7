//! Domain error taxonomy.
//!
//! Store and service functions return `anyhow::Result`; these variants ride
//! inside the `anyhow::Error` so callers that need to branch (HTTP status
//! mapping, batch retry) can recover them with `downcast_ref`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LarderError {
    /// A dataset row with no usable name field. The row is skipped.
    #[error("invalid row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },

    /// A nutrient value that did not parse as a number. The field stays unset.
    #[error("row {row}: could not parse {field} from '{value}'")]
    ParseError {
        row: usize,
        field: String,
        value: String,
    },

    /// A second or later occurrence of a normalized name during import.
    #[error("duplicate ingredient name '{0}'")]
    DuplicateName(String),

    /// The backing store is busy or locked. The current batch must be retried.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Two writers confirmed the same recipe ingredient concurrently.
    #[error("conflicting confirm for recipe ingredient '{0}'")]
    ConflictingConfirm(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl LarderError {
    /// Returns true when the error is transient and the operation may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ConflictingConfirm(_))
    }
}

/// Classify a rusqlite failure, turning busy/locked into `StoreUnavailable`.
pub(crate) fn classify_sqlite(err: rusqlite::Error) -> anyhow::Error {
    if let rusqlite::Error::SqliteFailure(ref inner, _) = err {
        if matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return LarderError::StoreUnavailable(err.to_string()).into();
        }
    }
    err.into()
}

/// True when `err` carries a `LarderError` that may be retried.
#[must_use]
pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LarderError>()
        .is_some_and(LarderError::is_retryable)
}
