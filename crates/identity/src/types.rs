//! Wire types returned by the identity provider

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Account role. Drives authorization and the landing location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Freelancer,
}

impl Role {
    /// Label for logs and health output.
    pub fn label(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Freelancer => "freelancer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Response from the refresh endpoint.
///
/// The provider only returns a new refresh token when rotation is enabled;
/// `refresh` is `None` otherwise and the caller keeps the old one.
#[derive(Deserialize, Serialize)]
pub struct TokenPair {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &"[REDACTED]")
            .field("rotated", &self.refresh.is_some())
            .finish()
    }
}

/// Response from the login endpoint.
#[derive(Deserialize, Serialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub role: Role,
    #[serde(default)]
    pub is_profiled: bool,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("role", &self.role)
            .field("is_profiled", &self.is_profiled)
            .finish_non_exhaustive()
    }
}

/// The caller's identity as resolved from an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: String,
    pub role: Role,
    /// Whether the account finished onboarding (`is_profiled`)
    pub profiled: bool,
    pub username: Option<String>,
    pub email: Option<String>,
}

/// `GET api/profile/` wraps the user under a `user` key.
#[derive(Deserialize)]
pub(crate) struct ProfileEnvelope {
    pub user: ProfileUser,
}

#[derive(Deserialize)]
pub(crate) struct ProfileUser {
    pub id: serde_json::Value,
    pub role: Role,
    #[serde(default)]
    pub is_profiled: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl TryFrom<ProfileEnvelope> for Identity {
    type Error = Error;

    fn try_from(envelope: ProfileEnvelope) -> Result<Self> {
        let user = envelope.user;
        let subject_id = subject_from_value(&user.id)
            .ok_or_else(|| Error::Parse(format!("unusable subject id: {}", user.id)))?;
        Ok(Identity {
            subject_id,
            role: user.role,
            profiled: user.is_profiled,
            username: user.username,
            email: user.email,
        })
    }
}

/// Subject ids arrive as integers from the backend but are opaque to us.
pub fn subject_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
