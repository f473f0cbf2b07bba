//! HTTP identity provider
//!
//! Talks to the backend's token endpoints. All paths are relative to the
//! configured `base_url` (e.g. `http://127.0.0.1:8000`).
//!
//! Status handling mirrors the backend's contract: 401/403 means the token or
//! credentials were rejected (`InvalidCredentials`); any other non-2xx is an
//! `Endpoint` error; transport failures are `Http` errors.

use std::future::Future;
use std::pin::Pin;

use serde_json::json;
use tracing::debug;

use crate::IdentityProvider;
use crate::error::{Error, Result};
use crate::types::{Identity, LoginResponse, ProfileEnvelope, TokenPair};

/// Token verification endpoint
pub const VERIFY_PATH: &str = "api/token_verify/";

/// Refresh token exchange endpoint
pub const REFRESH_PATH: &str = "api/token/refresh/";

/// Identity lookup for the bearer of an access token
pub const PROFILE_PATH: &str = "api/profile/";

/// Username/password login
pub const LOGIN_PATH: &str = "api/login/";

/// Refresh token blacklisting
pub const LOGOUT_PATH: &str = "api/logout/";

/// Identity provider backed by the real HTTP API.
#[derive(Debug, Clone)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn verify_token(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(VERIFY_PATH))
            .bearer_auth(token)
            .json(&json!({ "token": token }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("token verify request failed: {e}")))?;

        check_status(response, "token verify").await?;
        Ok(())
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair> {
        let response = self
            .client
            .post(self.endpoint(REFRESH_PATH))
            .json(&json!({ "refresh": refresh_token }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

        check_status(response, "token refresh")
            .await?
            .json::<TokenPair>()
            .await
            .map_err(|e| Error::Parse(format!("invalid refresh response: {e}")))
    }

    async fn fetch_identity(&self, access_token: &str) -> Result<Identity> {
        let response = self
            .client
            .get(self.endpoint(PROFILE_PATH))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::Http(format!("identity request failed: {e}")))?;

        let envelope = check_status(response, "identity lookup")
            .await?
            .json::<ProfileEnvelope>()
            .await
            .map_err(|e| Error::Parse(format!("invalid identity response: {e}")))?;
        Identity::try_from(envelope)
    }

    async fn login_user(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let response = self
            .client
            .post(self.endpoint(LOGIN_PATH))
            .json(&json!({
                "username": username,
                "password": password,
                "remember_me": false,
            }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("login request failed: {e}")))?;

        check_status(response, "login")
            .await?
            .json::<LoginResponse>()
            .await
            .map_err(|e| Error::Parse(format!("invalid login response: {e}")))
    }

    async fn logout_user(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(LOGOUT_PATH))
            .bearer_auth(access_token)
            .json(&json!({
                "accessToken": access_token,
                "refreshToken": refresh_token,
            }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("logout request failed: {e}")))?;

        check_status(response, "logout").await?;
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy.
async fn check_status(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    debug!(operation, status = status.as_u16(), "identity provider returned error");

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::InvalidCredentials(format!(
            "{operation} rejected ({status}): {body}"
        )));
    }

    Err(Error::Endpoint(format!(
        "{operation} returned {status}: {body}"
    )))
}

impl IdentityProvider for HttpIdentityProvider {
    fn verify<'a>(
        &'a self,
        token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.verify_token(token))
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>> {
        Box::pin(self.refresh_token(refresh_token))
    }

    fn identity<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Identity>> + Send + 'a>> {
        Box::pin(self.fetch_identity(access_token))
    }

    fn login<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LoginResponse>> + Send + 'a>> {
        Box::pin(self.login_user(username, password))
    }

    fn logout<'a>(
        &'a self,
        access_token: &'a str,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.logout_user(access_token, refresh_token))
    }
}
