//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Compare-and-set failed: the entity changed since it was read.
    #[error("stale state: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for opencicd_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => opencicd_core::Error::NotFound(what),
            DbError::Duplicate(what) => opencicd_core::Error::Conflict(format!("duplicate {what}")),
            DbError::Conflict(what) => opencicd_core::Error::Conflict(what),
            DbError::Unavailable(what) => opencicd_core::Error::Unavailable(what),
        }
    }
}
