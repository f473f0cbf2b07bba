//! Session credential management
//!
//! Holds the current user's token pair, decides locally whether the access
//! token is about to expire, validates tokens against the identity provider,
//! and coordinates refreshes so that concurrent callers share one request.
//!
//! Credential flow:
//! 1. `login()` stores the pair returned by the provider
//! 2. Readers call `CredentialStore::access_token()` on every use
//! 3. `expiry::is_expiring_soon()` flags tokens inside the refresh horizon
//! 4. `RefreshCoordinator::refresh()` rotates the pair (single flight)
//! 5. Rejected refresh or `logout()` clears the store

pub mod constants;
pub mod credentials;
pub mod error;
pub mod expiry;
pub mod login;
pub mod refresh;
pub mod validator;

pub use constants::*;
pub use credentials::{Credential, CredentialStore};
pub use error::{Error, Result};
pub use expiry::{TokenClaims, decode_claims, is_expiring_soon, is_expiring_soon_at};
pub use login::{login, logout};
pub use refresh::RefreshCoordinator;
pub use validator::is_valid;
