//! Configuration parsing errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("KDL parse error: {0}")]
    Parse(#[from] kdl::KdlError),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("invalid condition '{expression}': {message}")]
    InvalidCondition { expression: String, message: String },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for opencicd_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => opencicd_core::Error::Internal(e.to_string()),
            other => opencicd_core::Error::InvalidInput(other.to_string()),
        }
    }
}
