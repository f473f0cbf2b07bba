//! Session gate for protected work
//!
//! `SessionGuard` classifies the current session into an access decision and
//! keeps it current. It is an event-driven state machine: route entries run
//! the full authentication sequence, ticks re-check token expiry, and
//! completed refreshes are folded back into the state.
//!
//! Session lifecycle:
//! 1. `enter(RouteAccess::Protected(roles))` → `Loading`
//! 2. Expiring access token → single-flight refresh via `RefreshCoordinator`
//! 3. Server-side verification, one refresh on failure
//! 4. Identity lookup → `Authenticated` (authorized or sent to a landing path)
//! 5. Background poll re-checks expiry every `poll_interval`
//! 6. Any failure clears the credential → `Unauthenticated`

pub mod error;
pub mod guard;
pub mod poll;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
pub use guard::{
    AccessDecision, GuardConfig, LOGIN_PATH, RouteAccess, SessionContext, SessionEvent,
    SessionGuard, SessionState, VerifyTarget, landing_for,
};
pub use poll::{PollHandle, spawn_expiry_poll};
