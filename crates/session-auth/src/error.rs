//! Error types for credential operations

/// Errors from login, refresh and identity calls.
///
/// Cloneable so one refresh outcome can be handed to every caller waiting
/// on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("response carried no token: {0}")]
    MissingToken(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
