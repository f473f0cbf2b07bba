//! Session start and end

use identity::IdentityProvider;
use tracing::{info, warn};

use crate::credentials::{Credential, CredentialStore};
use crate::error::Result;
use crate::expiry::decode_claims;

/// Log in with username and password and store the returned credential.
///
/// The subject id is read from the access token's `user_id` claim.
pub async fn login(
    provider: &dyn IdentityProvider,
    store: &CredentialStore,
    username: &str,
    password: &str,
) -> Result<Credential> {
    let response = provider.login(username, password).await?;

    let subject_id = decode_claims(&response.access).and_then(|c| c.subject_id());
    let credential = Credential {
        access: response.access,
        refresh: response.refresh,
        role: response.role,
        subject_id,
    };

    store.set(credential.clone()).await?;
    info!(
        role = %credential.role,
        profiled = response.is_profiled,
        "logged in"
    );
    Ok(credential)
}

/// End the session.
///
/// The server-side blacklist call is best effort; the local store is cleared
/// regardless of its outcome.
pub async fn logout(provider: &dyn IdentityProvider, store: &CredentialStore) -> Result<()> {
    if let Some(credential) = store.get().await {
        if let Err(e) = provider.logout(&credential.access, &credential.refresh).await {
            warn!(error = %e, "server-side logout failed, clearing local session anyway");
        }
    }
    store.clear().await?;
    info!("logged out");
    Ok(())
}
