//! Identity provider abstraction for session management
//!
//! Defines the `IdentityProvider` trait that decouples session logic from the
//! HTTP API that issues and validates tokens. `HttpIdentityProvider` talks to
//! the real backend; tests substitute in-process fakes that count calls and
//! script responses.
//!
//! The provider is a collaborator, not an authority on session state: every
//! failure comes back as an `Error` value and the caller decides whether that
//! means "invalid", "retry later", or "log out".

pub mod error;
pub mod http;
pub mod types;

pub use error::{Error, Result};
pub use http::HttpIdentityProvider;
pub use types::{Identity, LoginResponse, Role, TokenPair};

use std::future::Future;
use std::pin::Pin;

/// Abstraction over the identity provider's token endpoints.
///
/// - `verify` checks a token server-side (any error means "not valid")
/// - `refresh` spends a refresh token for a new access token
/// - `identity` resolves the caller's role and subject from an access token
/// - `login` / `logout` bracket a session
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn IdentityProvider>`).
pub trait IdentityProvider: Send + Sync {
    /// Ask the provider whether `token` is currently valid.
    fn verify<'a>(&'a self, token: &'a str)
    -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Exchange a refresh token for a new token pair.
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>>;

    /// Look up the identity behind an access token.
    fn identity<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Identity>> + Send + 'a>>;

    /// Authenticate with username and password.
    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LoginResponse>> + Send + 'a>>;

    /// Blacklist the refresh token server-side.
    fn logout<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
