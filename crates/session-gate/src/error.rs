//! Error types surfaced to callers of the session layer

use crate::restriction::PlanRestriction;

/// Terminal outcomes of an outbound call or session operation.
///
/// Recoverable auth failures never appear here while recovery is still
/// possible; callers see them only once the request is abandoned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport failure: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("request failed with status {status}: {body}")]
    Status {
        status: u16,
        body: serde_json::Value,
    },

    #[error("plan restriction: {0}")]
    PlanRestricted(Box<PlanRestriction>),

    #[error("queued request dropped: {0}")]
    QueueCleared(String),

    #[error("request {0} is already queued")]
    AlreadyQueued(uuid::Uuid),

    #[error("authentication failed: {0}")]
    Auth(#[from] session_auth::Error),

    #[error("re-authentication failed {attempts} times, session ended")]
    HardAuth { attempts: u32 },
}

impl Error {
    /// HTTP status behind the failure, when there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Status { status, .. } => Some(*status),
            Error::PlanRestricted(_) => Some(403),
            _ => None,
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
