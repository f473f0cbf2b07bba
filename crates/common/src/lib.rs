//! Shared types for the session workspace: secret wrapper and config errors

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
