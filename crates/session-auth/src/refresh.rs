//! Single-flight access token refresh
//!
//! Concurrent callers of `RefreshCoordinator::refresh()` attach to one shared
//! in-flight request and all observe the same result. The request runs on its
//! own task so cancelling a waiter never strands the others.
//!
//! Outcomes:
//! - success: the store is rotated (compare-and-swap on the spent refresh
//!   token) and every waiter gets the new access token
//! - superseded: a login replaced the credential mid-flight; waiters get the
//!   store's current access token and nothing is overwritten
//! - failure (rejection, network, persistence): the spent credential is
//!   invalidated and every waiter gets `None`
//!
//! Refreshes are not retried here. The session poll calls again on its next
//! tick if the token is still expiring.

use std::sync::Arc;

use common::Secret;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use identity::IdentityProvider;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;

type Flight = Shared<BoxFuture<'static, Option<Secret<String>>>>;

/// Serializes refresh attempts against one credential store.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<CredentialStore>,
    provider: Arc<dyn IdentityProvider>,
    in_flight: Mutex<Option<Flight>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<CredentialStore>, provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                provider,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Refresh the access token, joining an in-flight refresh if one exists.
    ///
    /// Returns the new access token, or `None` when there is no session or the
    /// refresh failed (in which case the session has been cleared).
    pub async fn refresh(&self) -> Option<Secret<String>> {
        let flight = {
            let mut slot = self.inner.in_flight.lock().await;
            match slot.as_ref() {
                Some(flight) => {
                    debug!("joining in-flight refresh");
                    flight.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move { inner.run().await });
                    let owner = Arc::downgrade(&self.inner);
                    let flight = async move {
                        match task.await {
                            Ok(token) => token,
                            Err(e) => {
                                // `run` never reached its own cleanup
                                warn!(error = %e, "refresh task ended abnormally");
                                if let Some(inner) = owner.upgrade() {
                                    inner.in_flight.lock().await.take();
                                }
                                record_outcome("failure");
                                None
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Whether a refresh is currently in flight.
    pub async fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().await.is_some()
    }
}

impl Inner {
    async fn run(&self) -> Option<Secret<String>> {
        let result = self.attempt().await;
        // Clear before waiters resolve so the next caller starts a fresh flight
        self.in_flight.lock().await.take();
        result
    }

    async fn attempt(&self) -> Option<Secret<String>> {
        let Some(expected) = self.store.refresh_token().await else {
            debug!("no refresh token, skipping refresh");
            record_outcome("no_session");
            return None;
        };

        let pair = match self.provider.refresh(&expected).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, rejected = e.is_rejection(), "token refresh failed, clearing session");
                self.invalidate(&expected).await;
                record_outcome("failure");
                return None;
            }
        };

        match self.store.rotate(&expected, pair.access, pair.refresh).await {
            Ok(Some(credential)) => {
                info!(role = %credential.role, "access token refreshed");
                record_outcome("success");
                Some(Secret::new(credential.access))
            }
            Ok(None) => {
                debug!("refresh superseded by a newer credential");
                record_outcome("superseded");
                self.store.access_token().await.map(Secret::new)
            }
            Err(e) => {
                warn!(error = %e, "failed to persist refreshed credential, clearing session");
                self.invalidate(&expected).await;
                record_outcome("failure");
                None
            }
        }
    }

    async fn invalidate(&self, expected_refresh: &str) {
        if let Err(e) = self.store.invalidate(expected_refresh).await {
            warn!(error = %e, "failed to clear credential after refresh failure");
        }
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}
