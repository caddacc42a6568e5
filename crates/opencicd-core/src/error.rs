//! Error types for Open-CICD.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsm::InvalidTransition;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("out of order: {0}")]
    OutOfOrder(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request is invalid for the current state; do not retry as-is.
    Rejected,
    /// Lost a race; re-fetch state before retrying.
    Conflict,
    /// Infrastructure problem; retry later with backoff.
    Unavailable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidTransition(_)
            | Error::OutOfOrder(_)
            | Error::NotFound(_)
            | Error::InvalidInput(_) => ErrorKind::Rejected,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Unavailable(_) | Error::Delivery(_) | Error::Internal(_) => {
                ErrorKind::Unavailable
            }
        }
    }

    /// Duplicate or out-of-order agent events. Agents may drop these.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Error::InvalidTransition(_) | Error::OutOfOrder(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
