//! Error types for the realtime channel

/// Errors from realtime channel operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("connection manager has shut down")]
    Shutdown,

    #[error("invalid realtime URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Result alias for realtime operations.
pub type Result<T> = std::result::Result<T, Error>;
