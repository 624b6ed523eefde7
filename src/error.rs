//! Error taxonomy shared by every engine component.
//!
//! Callers match on the variant to distinguish bad input from missing
//! records, lost races and internal failures. Degraded-but-successful
//! outcomes (insufficient training data, skipped refinement, lexical
//! fallback) are statuses on their reports, not errors.

use std::fmt::Display;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The caller's input is rejected.
    #[error("validation error: {0}")]
    Validation(String),

    /// A concurrent writer won a uniqueness or single-flight race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Prediction was requested before any model was committed.
    #[error("no classifier model has been trained")]
    NotTrained,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] time::error::ComponentRange),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Maps an insert failure, turning a unique-constraint violation into
    /// a [`Error::Conflict`] the caller can retry on.
    pub fn from_insert(err: rusqlite::Error, what: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(format!("{what} already exists"))
            }
            _ => Self::Database(err),
        }
    }
}
