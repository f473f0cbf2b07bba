//! Session timing defaults
//!
//! These match the web client's behaviour: tokens inside a one minute window
//! are refreshed, the session is re-checked every 30 seconds, and persisted
//! credentials live for one day.

use std::time::Duration;

/// Access tokens expiring within this window are treated as expiring
pub const EXPIRY_HORIZON: Duration = Duration::from_secs(60);

/// Interval of the background session poll
pub const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Lifetime of a persisted credential file
pub const CREDENTIAL_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
