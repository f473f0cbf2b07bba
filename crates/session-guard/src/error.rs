//! Error types for session guard operations

/// Errors surfaced while resolving a session.
///
/// The guard never returns these from `enter`/`tick`; they are converted into
/// `SessionState::Unauthenticated` at the boundary. Only explicit `login` and
/// `logout` calls report them to the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential error: {0}")]
    Credential(#[from] session_auth::Error),

    #[error("identity lookup failed: {0}")]
    Identity(#[from] identity::Error),
}

/// Result alias for session guard operations.
pub type Result<T> = std::result::Result<T, Error>;
