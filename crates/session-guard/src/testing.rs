//! Test fixtures: scripted identity provider and JWT builders.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use identity::{Error, Identity, IdentityProvider, LoginResponse, Result, Role, TokenPair};
use session_auth::{Credential, CredentialStore, decode_claims};

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn token(exp: u64, user_id: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({"exp": exp, "user_id": user_id, "token_type": "access"});
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.sig")
}

/// Access token valid for another hour.
pub fn fresh_token(user_id: u64) -> String {
    token(now() + 3600, user_id)
}

/// Access token expiring in 30 seconds.
pub fn expiring_token(user_id: u64) -> String {
    token(now() + 30, user_id)
}

pub async fn store_with(access: &str, refresh: &str, role: Role) -> Arc<CredentialStore> {
    let store = Arc::new(CredentialStore::in_memory());
    store
        .set(Credential {
            access: access.into(),
            refresh: refresh.into(),
            role,
            subject_id: None,
        })
        .await
        .unwrap();
    store
}

pub struct FakeProvider {
    role: Role,
    valid: Mutex<HashSet<String>>,
    refresh_result: Mutex<std::result::Result<(String, Option<String>), String>>,
    login_result: Mutex<Option<LoginResponse>>,
    refresh_delay: Mutex<Duration>,
    pub refresh_calls: AtomicUsize,
    pub identity_fails: AtomicBool,
}

impl FakeProvider {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            valid: Mutex::new(HashSet::new()),
            refresh_result: Mutex::new(Err("not scripted".into())),
            login_result: Mutex::new(None),
            refresh_delay: Mutex::new(Duration::ZERO),
            refresh_calls: AtomicUsize::new(0),
            identity_fails: AtomicBool::new(false),
        }
    }

    pub fn allow(&self, token: &str) {
        self.valid.lock().unwrap().insert(token.to_string());
    }

    pub fn script_refresh(&self, result: std::result::Result<(String, Option<String>), String>) {
        *self.refresh_result.lock().unwrap() = result;
    }

    /// Make every refresh take `delay` before answering.
    pub fn slow_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = delay;
    }

    pub fn script_login(&self, access: String, refresh: &str, role: Role) {
        *self.login_result.lock().unwrap() = Some(LoginResponse {
            access,
            refresh: refresh.into(),
            role,
            is_profiled: true,
        });
    }
}

impl IdentityProvider for FakeProvider {
    fn verify<'a>(&'a self, token: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if self.valid.lock().unwrap().contains(token) {
                Ok(())
            } else {
                Err(Error::InvalidCredentials("Token is invalid or expired".into()))
            }
        })
    }

    fn refresh<'a>(
        &'a self,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenPair>> + Send + 'a>> {
        Box::pin(async move {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.refresh_result.lock().unwrap().clone();
            match scripted {
                Ok((access, refresh)) => Ok(TokenPair { access, refresh }),
                Err(e) => Err(Error::InvalidCredentials(e)),
            }
        })
    }

    fn identity<'a>(
        &'a self,
        access_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Identity>> + Send + 'a>> {
        Box::pin(async move {
            if self.identity_fails.load(Ordering::SeqCst) {
                return Err(Error::Endpoint("profile returned 500".into()));
            }
            let subject_id = decode_claims(access_token)
                .and_then(|c| c.subject_id())
                .unwrap_or_else(|| "0".into());
            Ok(Identity {
                subject_id,
                role: self.role,
                profiled: false,
                username: Some("fixture".into()),
                email: None,
            })
        })
    }

    fn login<'a>(
        &'a self,
        _username: &'a str,
        _password: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<LoginResponse>> + Send + 'a>> {
        Box::pin(async move {
            let scripted = self.login_result.lock().unwrap().take();
            scripted.ok_or_else(|| Error::Endpoint("login returned 400".into()))
        })
    }

    fn logout<'a>(
        &'a self,
        _access_token: &'a str,
        _refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}
