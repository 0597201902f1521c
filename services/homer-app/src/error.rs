//! HTTP-facing error type
//!
//! Every failure renders as `{statusCode, message, error}` where `error` is
//! the HTTP reason phrase.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Errors a handler can answer with.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequestFormat(String),

    #[error("{0}")]
    ValidationFailed(String),

    /// Login failure. Same message whether or not the user exists.
    #[error("incorrect password")]
    Unauthorized,

    #[error("State invalid")]
    InvalidState,

    #[error("Code not found")]
    MissingCode,

    #[error("token exchange failed")]
    ExchangeFailed,

    #[error("missing or invalid bearer token")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequestFormat(_)
            | ApiError::ValidationFailed(_)
            | ApiError::InvalidState
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized | ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MissingCode | ApiError::ExchangeFailed | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<homer_auth::Error> for ApiError {
    fn from(err: homer_auth::Error) -> Self {
        use homer_auth::Error as E;
        match err {
            E::UserNotFound(_) | E::InvalidCredential(_) => ApiError::Unauthorized,
            E::InvalidToken(_) => ApiError::Unauthenticated,
            E::InvalidState => ApiError::InvalidState,
            E::MissingCode => ApiError::MissingCode,
            E::ExchangeFailed(_) => ApiError::ExchangeFailed,
            E::Validation(msg) => ApiError::ValidationFailed(msg),
            E::Conflict(username) => {
                ApiError::BadRequest(format!("username already exists: {username}"))
            }
            E::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            E::Forbidden(msg) => ApiError::Forbidden(msg),
            E::Signing(_) | E::StoreParse(_) | E::Io(_) | E::Internal(_) => {
                error!(error = %err, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        json_response(
            status,
            serde_json::json!({
                "statusCode": status.as_u16(),
                "message": self.to_string(),
                "error": status.canonical_reason().unwrap_or("Error"),
            }),
        )
    }
}

/// JSON body with an explicit status.
pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}
