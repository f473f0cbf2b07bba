//! Error types for identity provider calls

/// Errors from identity provider operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// 401/403: the token or credentials were rejected outright
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("identity endpoint error: {0}")]
    Endpoint(String),

    #[error("invalid response: {0}")]
    Parse(String),
}

impl Error {
    /// Whether the provider explicitly rejected the credential (as opposed
    /// to a transport failure or server error).
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::InvalidCredentials(_))
    }
}

/// Result alias for identity provider operations.
pub type Result<T> = std::result::Result<T, Error>;
