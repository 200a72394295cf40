//! Error kinds raised by the server core.

/// Failure modes of a forward operation, before it is flattened into an
/// HTTP-shaped outcome for the caller.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("tunnel not connected: {0}")]
    NotConnected(String),
    #[error("request timeout")]
    Timeout,
    #[error("session closed")]
    SessionClosed,
    #[error("too many pending requests")]
    PendingLimit,
}

/// Tunnel store failures. Bubbled to the HTTP surface as 5xx; they never
/// panic the session loop.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tunnel not found")]
    NotFound,
    #[error("domain already exists")]
    DuplicateDomain,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
