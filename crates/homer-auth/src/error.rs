//! Error types for authentication and user store operations

/// Errors from the auth core and the user store.
///
/// `UserNotFound` and `InvalidCredential` are kept apart for logging; callers
/// facing the network must collapse them into one generic outcome.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("invalid credential for user {0}")]
    InvalidCredential(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("invalid bearer token: {0}")]
    InvalidToken(String),

    #[error("OAuth state invalid")]
    InvalidState,

    #[error("authorization code not found")]
    MissingCode,

    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("username already exists: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("user store parse error: {0}")]
    StoreParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
