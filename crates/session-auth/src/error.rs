//! Error types for credential and session operations

/// Errors from credential storage and login/logout.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("login failed: {0}")]
    Login(#[from] identity::Error),
}

/// Result alias for session auth operations.
pub type Result<T> = std::result::Result<T, Error>;
