//! Session state machine and access decisions

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use identity::{IdentityProvider, Role};
use serde::Deserialize;
use session_auth::{Credential, CredentialStore, RefreshCoordinator, is_expiring_soon, is_valid};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Where unauthenticated visitors are sent.
pub const LOGIN_PATH: &str = "/login";

/// Landing location for a role.
///
/// Freelancers who have not finished onboarding land on the profiling flow.
pub fn landing_for(role: Role, profiled: bool) -> &'static str {
    match (role, profiled) {
        (Role::Client, _) => "/client/dashboard",
        (Role::Freelancer, false) => "/profiling",
        (Role::Freelancer, true) => "/freelancer/homepage",
    }
}

/// Which token the guard checks with the provider on entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyTarget {
    /// The refresh token; a live refresh token means the session can recover
    #[default]
    Refresh,
    Access,
    Both,
}

/// Timing and verification settings.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Access tokens expiring within this window are refreshed
    pub expiry_horizon: Duration,
    /// Interval of the background expiry poll
    pub poll_interval: Duration,
    pub verify: VerifyTarget,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            expiry_horizon: session_auth::EXPIRY_HORIZON,
            poll_interval: session_auth::SESSION_POLL_INTERVAL,
            verify: VerifyTarget::default(),
        }
    }
}

/// Access requirement of a piece of protected work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    /// Requires a session; an empty set admits any role
    Protected(BTreeSet<Role>),
}

impl RouteAccess {
    pub fn protected(roles: impl IntoIterator<Item = Role>) -> Self {
        RouteAccess::Protected(roles.into_iter().collect())
    }
}

/// Identity fields of an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub role: Role,
    pub subject_id: String,
    pub username: Option<String>,
    pub profiled: bool,
    /// Whether the role satisfies the current requirement
    pub authorized: bool,
}

impl SessionContext {
    pub fn landing(&self) -> &'static str {
        landing_for(self.role, self.profiled)
    }
}

/// Current classification of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Unauthenticated,
    Authenticated(SessionContext),
}

impl SessionState {
    /// Label for logs and health output.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Loading => "loading",
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticated(_) => "authenticated",
        }
    }

    pub fn context(&self) -> Option<&SessionContext> {
        match self {
            SessionState::Authenticated(context) => Some(context),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }
}

/// Outcome of entering a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Public,
    Unauthenticated,
    Unauthorized { landing: &'static str },
    Authorized(SessionContext),
}

impl AccessDecision {
    /// Location the visitor should be sent to instead, if any.
    pub fn redirect(&self) -> Option<&'static str> {
        match self {
            AccessDecision::Unauthenticated => Some(LOGIN_PATH),
            AccessDecision::Unauthorized { landing } => Some(*landing),
            AccessDecision::Public | AccessDecision::Authorized(_) => None,
        }
    }
}

/// Inputs to the session state machine.
#[derive(Debug)]
pub enum SessionEvent {
    /// Protected work is starting; run the full authentication sequence
    RouteEntered(BTreeSet<Role>),
    /// Periodic expiry check
    Tick,
    /// A refresh resolved (`None` = failed, session already cleared)
    RefreshCompleted(Option<Secret<String>>),
}

/// Gatekeeper for the current session.
///
/// State is published on a `watch` channel; `subscribe()` to follow it.
pub struct SessionGuard {
    store: Arc<CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    coordinator: RefreshCoordinator,
    config: GuardConfig,
    state: watch::Sender<SessionState>,
    required: Mutex<BTreeSet<Role>>,
}

impl SessionGuard {
    pub fn new(
        store: Arc<CredentialStore>,
        provider: Arc<dyn IdentityProvider>,
        coordinator: RefreshCoordinator,
        config: GuardConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        Self {
            store,
            provider,
            coordinator,
            config,
            state,
            required: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Follow state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Feed one event through the state machine and publish the result.
    pub async fn handle(&self, event: SessionEvent) -> SessionState {
        let next = match event {
            SessionEvent::RouteEntered(required) => {
                *self.required.lock().await = required.clone();
                self.authenticate_inner(&required).await
            }
            SessionEvent::Tick => self.on_tick().await,
            SessionEvent::RefreshCompleted(token) => self.on_refresh_completed(token),
        };
        self.publish(next.clone());
        next
    }

    /// Run the authentication sequence for `required` roles.
    pub async fn authenticate(&self, required: BTreeSet<Role>) -> SessionState {
        self.handle(SessionEvent::RouteEntered(required)).await
    }

    /// Re-check expiry of the current access token.
    pub async fn tick(&self) -> SessionState {
        self.handle(SessionEvent::Tick).await
    }

    /// Classify the visitor for a piece of work.
    pub async fn enter(&self, access: RouteAccess) -> AccessDecision {
        let required = match access {
            RouteAccess::Public => return AccessDecision::Public,
            RouteAccess::Protected(required) => required,
        };

        match self.authenticate(required).await {
            SessionState::Authenticated(context) if context.authorized => {
                AccessDecision::Authorized(context)
            }
            SessionState::Authenticated(context) => {
                let landing = context.landing();
                info!(role = %context.role, landing, "role not permitted, redirecting");
                AccessDecision::Unauthorized { landing }
            }
            SessionState::Loading | SessionState::Unauthenticated => {
                AccessDecision::Unauthenticated
            }
        }
    }

    /// Log in and re-run authentication against the last requirement.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionState> {
        session_auth::login(self.provider.as_ref(), &self.store, username, password).await?;
        let required = self.required.lock().await.clone();
        Ok(self.authenticate(required).await)
    }

    /// End the session.
    pub async fn logout(&self) -> Result<()> {
        let result = session_auth::logout(self.provider.as_ref(), &self.store).await;
        self.publish(SessionState::Unauthenticated);
        result?;
        Ok(())
    }

    fn publish(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        let current = self.state.borrow();
        if previous.label() != current.label() {
            debug!(from = previous.label(), to = current.label(), "session state changed");
        }
    }

    async fn authenticate_inner(&self, required: &BTreeSet<Role>) -> SessionState {
        self.publish(SessionState::Loading);

        match self.resolve(required).await {
            Some(context) => {
                info!(
                    role = %context.role,
                    subject_id = %context.subject_id,
                    authorized = context.authorized,
                    "session authenticated"
                );
                SessionState::Authenticated(context)
            }
            None => SessionState::Unauthenticated,
        }
    }

    /// `None` means no usable session.
    ///
    /// Failures only drop the credential that was checked; one written by a
    /// concurrent login is left alone. A failed refresh has already been
    /// handled by the coordinator.
    async fn resolve(&self, required: &BTreeSet<Role>) -> Option<SessionContext> {
        let Some(mut credential) = self.store.get().await else {
            debug!("no access token");
            return None;
        };

        if is_expiring_soon(&credential.access, self.config.expiry_horizon) {
            debug!("access token expiring, refreshing");
            credential = self.refreshed().await?;
        }

        if !self.verify(&credential.access, &credential.refresh).await {
            info!("session failed verification, refreshing once");
            credential = self.refreshed().await?;
            if !self.verify(&credential.access, &credential.refresh).await {
                warn!("session failed verification after refresh");
                self.invalidate(&credential.refresh).await;
                return None;
            }
        }

        let identity = match self.provider.identity(&credential.access).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "identity lookup failed, clearing credential");
                self.invalidate(&credential.refresh).await;
                return None;
            }
        };
        let authorized = required.is_empty() || required.contains(&identity.role);
        Some(SessionContext {
            role: identity.role,
            subject_id: identity.subject_id,
            username: identity.username,
            profiled: identity.profiled,
            authorized,
        })
    }

    /// Refresh, then re-read the stored credential.
    async fn refreshed(&self) -> Option<Credential> {
        self.coordinator.refresh().await?;
        self.store.get().await
    }

    async fn verify(&self, access: &str, refresh: &str) -> bool {
        let provider = self.provider.as_ref();
        match self.config.verify {
            VerifyTarget::Access => is_valid(provider, access).await,
            VerifyTarget::Refresh => is_valid(provider, refresh).await,
            VerifyTarget::Both => {
                is_valid(provider, access).await && is_valid(provider, refresh).await
            }
        }
    }

    async fn on_tick(&self) -> SessionState {
        let current = self.state();
        if !current.is_authenticated() {
            return current;
        }

        let Some(access) = self.store.access_token().await else {
            info!("credential gone, session ended");
            return SessionState::Unauthenticated;
        };

        if !is_expiring_soon(&access, self.config.expiry_horizon) {
            return current;
        }

        debug!("access token expiring, refreshing from poll");
        let token = self.coordinator.refresh().await;
        self.on_refresh_completed(token)
    }

    fn on_refresh_completed(&self, token: Option<Secret<String>>) -> SessionState {
        match token {
            Some(_) => self.state(),
            None => {
                info!("refresh failed, session ended");
                SessionState::Unauthenticated
            }
        }
    }

    async fn invalidate(&self, refresh: &str) {
        match self.store.invalidate(refresh).await {
            Ok(true) => {}
            Ok(false) => debug!("credential replaced meanwhile, keeping it"),
            Err(e) => warn!(error = %e, "failed to clear credential"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProvider, expiring_token, fresh_token, store_with};
    use std::sync::atomic::Ordering;

    fn guard(
        store: Arc<CredentialStore>,
        provider: Arc<FakeProvider>,
        verify: VerifyTarget,
    ) -> SessionGuard {
        let coordinator = RefreshCoordinator::new(store.clone(), provider.clone());
        SessionGuard::new(
            store,
            provider,
            coordinator,
            GuardConfig {
                verify,
                ..GuardConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn no_token_is_unauthenticated() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        let store = Arc::new(CredentialStore::in_memory());
        let guard = guard(store, provider, VerifyTarget::Refresh);

        let decision = guard.enter(RouteAccess::protected([Role::Client])).await;
        assert_eq!(decision, AccessDecision::Unauthenticated);
        assert_eq!(decision.redirect(), Some(LOGIN_PATH));
        assert_eq!(guard.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once_on_entry() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        let new_access = fresh_token(1);
        provider.script_refresh(Ok((new_access.clone(), Some("rt_new".into()))));
        provider.allow("rt_new");
        let store = store_with(&expiring_token(1), "rt_old", Role::Client).await;
        let guard = guard(store.clone(), provider.clone(), VerifyTarget::Refresh);

        let decision = guard.enter(RouteAccess::protected([Role::Client])).await;

        assert!(matches!(decision, AccessDecision::Authorized(_)), "got {decision:?}");
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().await, Some(new_access));
        assert!(guard.state().is_authenticated());
    }

    #[tokio::test]
    async fn rejected_refresh_clears_store() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.script_refresh(Err("token is blacklisted".into()));
        let store = store_with(&expiring_token(1), "rt_old", Role::Client).await;
        let guard = guard(store.clone(), provider, VerifyTarget::Refresh);

        let state = guard.authenticate(BTreeSet::new()).await;

        assert_eq!(state, SessionState::Unauthenticated);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn login_during_failed_refresh_is_kept() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.script_refresh(Err("token is blacklisted".into()));
        provider.slow_refresh(Duration::from_millis(50));
        let store = store_with(&expiring_token(1), "rt_old", Role::Client).await;
        let guard = Arc::new(guard(store.clone(), provider, VerifyTarget::Refresh));

        let check = tokio::spawn({
            let guard = guard.clone();
            async move { guard.authenticate(BTreeSet::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store
            .set(Credential {
                access: fresh_token(2),
                refresh: "rt_login".into(),
                role: Role::Client,
                subject_id: None,
            })
            .await
            .unwrap();

        assert_eq!(check.await.unwrap(), SessionState::Unauthenticated);
        assert_eq!(store.refresh_token().await.as_deref(), Some("rt_login"));
    }

    #[tokio::test]
    async fn invalidation_only_drops_the_checked_credential() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        provider.identity_fails.store(true, Ordering::SeqCst);
        let store = store_with(&fresh_token(8), "rt_ok", Role::Client).await;
        let guard = guard(store.clone(), provider, VerifyTarget::Refresh);

        // Only the checked refresh token is ever dropped
        guard.invalidate("rt_other").await;
        assert_eq!(store.refresh_token().await.as_deref(), Some("rt_ok"));

        guard.authenticate(BTreeSet::new()).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_verification_refreshes_once_then_succeeds() {
        let provider = Arc::new(FakeProvider::new(Role::Freelancer));
        provider.script_refresh(Ok((fresh_token(2), Some("rt_new".into()))));
        provider.allow("rt_new");
        let store = store_with(&fresh_token(2), "rt_stale", Role::Freelancer).await;
        let guard = guard(store, provider.clone(), VerifyTarget::Refresh);

        let state = guard.authenticate(BTreeSet::new()).await;

        assert!(state.is_authenticated());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_failed_verification_is_unauthenticated() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.script_refresh(Ok((fresh_token(3), None)));
        let store = store_with(&fresh_token(3), "rt_revoked", Role::Client).await;
        let guard = guard(store.clone(), provider.clone(), VerifyTarget::Refresh);

        let state = guard.authenticate(BTreeSet::new()).await;

        assert_eq!(state, SessionState::Unauthenticated);
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn access_verification_target() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        let access = fresh_token(4);
        provider.allow(&access);
        let store = store_with(&access, "rt_unverifiable", Role::Client).await;
        let guard = guard(store, provider.clone(), VerifyTarget::Access);

        assert!(guard.authenticate(BTreeSet::new()).await.is_authenticated());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn both_verification_target_requires_both() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        let access = fresh_token(5);
        provider.allow(&access);
        provider.script_refresh(Err("nope".into()));
        let store = store_with(&access, "rt_unverifiable", Role::Client).await;
        let guard = guard(store, provider, VerifyTarget::Both);

        assert_eq!(
            guard.authenticate(BTreeSet::new()).await,
            SessionState::Unauthenticated
        );
    }

    #[tokio::test]
    async fn wrong_role_gets_landing_location() {
        let provider = Arc::new(FakeProvider::new(Role::Freelancer));
        provider.allow("rt_ok");
        let store = store_with(&fresh_token(6), "rt_ok", Role::Freelancer).await;
        let guard = guard(store, provider, VerifyTarget::Refresh);

        let decision = guard.enter(RouteAccess::protected([Role::Client])).await;
        assert_eq!(decision, AccessDecision::Unauthorized { landing: "/profiling" });
        assert_eq!(decision.redirect(), Some("/profiling"));

        let context = guard.state().context().cloned().unwrap();
        assert!(!context.authorized);
        assert_eq!(context.subject_id, "6");
    }

    #[tokio::test]
    async fn public_routes_skip_the_session_check() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        let store = Arc::new(CredentialStore::in_memory());
        let guard = guard(store, provider, VerifyTarget::Refresh);

        assert_eq!(guard.enter(RouteAccess::Public).await, AccessDecision::Public);
        assert_eq!(guard.state(), SessionState::Loading);
    }

    #[tokio::test]
    async fn identity_failure_clears_session() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        provider.identity_fails.store(true, Ordering::SeqCst);
        let store = store_with(&fresh_token(7), "rt_ok", Role::Client).await;
        let guard = guard(store.clone(), provider, VerifyTarget::Refresh);

        assert_eq!(
            guard.authenticate(BTreeSet::new()).await,
            SessionState::Unauthenticated
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn tick_refreshes_expiring_token() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        let new_access = fresh_token(8);
        provider.script_refresh(Ok((new_access.clone(), None)));
        let store = store_with(&fresh_token(8), "rt_ok", Role::Client).await;
        let guard = guard(store.clone(), provider.clone(), VerifyTarget::Refresh);
        assert!(guard.authenticate(BTreeSet::new()).await.is_authenticated());

        // Fresh token: tick is a no-op
        assert!(guard.tick().await.is_authenticated());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 0);

        store
            .rotate("rt_ok", expiring_token(8), None)
            .await
            .unwrap()
            .unwrap();
        assert!(guard.tick().await.is_authenticated());
        assert_eq!(provider.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.access_token().await, Some(new_access));
    }

    #[tokio::test]
    async fn tick_without_credential_ends_session() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        let store = store_with(&fresh_token(9), "rt_ok", Role::Client).await;
        let guard = guard(store.clone(), provider, VerifyTarget::Refresh);
        assert!(guard.authenticate(BTreeSet::new()).await.is_authenticated());

        store.clear().await.unwrap();
        assert_eq!(guard.tick().await, SessionState::Unauthenticated);

        // Unauthenticated does not recover on its own
        assert_eq!(guard.tick().await, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn failed_refresh_event_ends_session() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        let store = store_with(&fresh_token(10), "rt_ok", Role::Client).await;
        let guard = guard(store, provider, VerifyTarget::Refresh);
        assert!(guard.authenticate(BTreeSet::new()).await.is_authenticated());

        let kept = guard
            .handle(SessionEvent::RefreshCompleted(Some(Secret::new("at".into()))))
            .await;
        assert!(kept.is_authenticated());

        let ended = guard.handle(SessionEvent::RefreshCompleted(None)).await;
        assert_eq!(ended, SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn subscribers_observe_transitions() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_ok");
        let store = store_with(&fresh_token(11), "rt_ok", Role::Client).await;
        let guard = guard(store, provider, VerifyTarget::Refresh);
        let mut rx = guard.subscribe();

        guard.authenticate(BTreeSet::new()).await;
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_authenticated());

        guard.logout().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn login_then_authenticate() {
        let provider = Arc::new(FakeProvider::new(Role::Client));
        provider.allow("rt_login");
        provider.script_login(fresh_token(12), "rt_login", Role::Client);
        let store = Arc::new(CredentialStore::in_memory());
        let guard = guard(store.clone(), provider, VerifyTarget::Refresh);

        assert_eq!(
            guard.enter(RouteAccess::protected([Role::Client])).await,
            AccessDecision::Unauthenticated
        );

        let state = guard.login("ada", "hunter2").await.unwrap();
        let context = state.context().unwrap();
        assert!(context.authorized);
        assert_eq!(store.get().await.unwrap().subject_id.as_deref(), Some("12"));
    }

    #[test]
    fn landing_policy() {
        assert_eq!(landing_for(Role::Client, false), "/client/dashboard");
        assert_eq!(landing_for(Role::Freelancer, false), "/profiling");
        assert_eq!(landing_for(Role::Freelancer, true), "/freelancer/homepage");
    }
}
