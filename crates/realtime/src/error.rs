//! Error types for the realtime channel

/// Realtime failures that reach callers.
///
/// Transport drops are not errors here; they surface as connection state
/// changes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("channel unavailable: {0}")]
    Channel(String),
}

/// Result alias for realtime operations.
pub type Result<T> = std::result::Result<T, Error>;
