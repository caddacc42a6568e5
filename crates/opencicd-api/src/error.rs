//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opencicd_core::{Error, ErrorKind};
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotFound(_) | ApiError::BadRequest(_) => ErrorKind::Rejected,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::Unavailable(_) | ApiError::Internal(_) => ErrorKind::Unavailable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match self {
            ApiError::NotFound(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::Unavailable(msg)
            | ApiError::Internal(msg) => msg,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %message, "Internal error");
        }

        let body = Json(json!({
            "error": message,
            "kind": kind,
        }));

        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::InvalidTransition(_) | Error::OutOfOrder(_) | Error::InvalidInput(_) => {
                ApiError::BadRequest(message)
            }
            Error::Conflict(_) => ApiError::Conflict(message),
            Error::Unavailable(_) | Error::Delivery(_) => ApiError::Unavailable(message),
            Error::Internal(_) => ApiError::Internal(message),
        }
    }
}

impl From<opencicd_config::ConfigError> for ApiError {
    fn from(err: opencicd_config::ConfigError) -> Self {
        ApiError::from(Error::from(err))
    }
}
