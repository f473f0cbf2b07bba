//! Local access token expiry checks
//!
//! Reads the JWT payload without verifying the signature. The provider is the
//! authority on validity; this only decides when to refresh proactively.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

/// Claims read from an access token payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenClaims {
    /// Expiry as unix seconds
    pub exp: u64,
    /// Subject, numeric or string depending on the backend
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenClaims {
    /// Subject id as an opaque string.
    pub fn subject_id(&self) -> Option<String> {
        self.user_id
            .as_ref()
            .and_then(identity::types::subject_from_value)
    }
}

/// Decode the payload segment of a JWT.
///
/// Returns `None` for anything that is not three dot-separated segments with
/// a base64url JSON payload carrying `exp`.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let mut segments = token.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Whether `token` expires within `horizon` of now.
///
/// Undecodable tokens count as expiring.
pub fn is_expiring_soon(token: &str, horizon: Duration) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    is_expiring_soon_at(token, horizon, now)
}

/// `is_expiring_soon` against an explicit clock (unix seconds).
pub fn is_expiring_soon_at(token: &str, horizon: Duration, now_secs: u64) -> bool {
    match decode_claims(token) {
        Some(claims) => claims.exp.saturating_sub(now_secs) < horizon.as_secs(),
        None => true,
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.signature")
}
