//! Server-side token validation

use identity::IdentityProvider;
use tracing::debug;

/// Ask the provider whether `token` is valid.
///
/// Rejections, server errors and transport failures all read as invalid.
pub async fn is_valid(provider: &dyn IdentityProvider, token: &str) -> bool {
    match provider.verify(token).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, rejected = e.is_rejection(), "token failed verification");
            false
        }
    }
}
