//! Credential storage for the current session
//!
//! Holds at most one credential (access + refresh token pair, role, subject).
//! The pair is stored as a single value, so readers see either a complete
//! credential or none at all. A tokio Mutex serializes writers (login, refresh
//! rotation, logout); reads clone under the lock.
//!
//! File-backed stores persist every change with an atomic temp-file + rename
//! and 0600 permissions. Persisted credentials carry a `stored_at` stamp and
//! are discarded on load once older than `max_age`. In-memory stores skip
//! persistence entirely and exist for tests and ephemeral sessions.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use identity::Role;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// The current user's session credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Short-lived bearer token for API calls and the realtime channel
    pub access: String,
    /// Longer-lived token used only to mint new access tokens
    pub refresh: String,
    pub role: Role,
    /// Subject id from the access token's `user_id` claim, when present
    #[serde(default)]
    pub subject_id: Option<String>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"[REDACTED]")
            .field("refresh", &"[REDACTED]")
            .field("role", &self.role)
            .field("subject_id", &self.subject_id)
            .finish()
    }
}

/// On-disk representation: the credential plus its storage timestamp.
#[derive(Serialize, Deserialize)]
struct Persisted {
    #[serde(flatten)]
    credential: Credential,
    /// Unix timestamp in milliseconds
    stored_at: u64,
}

/// Thread-safe holder of the session credential.
pub struct CredentialStore {
    path: Option<PathBuf>,
    state: Mutex<Option<Credential>>,
}

impl CredentialStore {
    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(None),
        }
    }

    /// Load the credential from `path`.
    ///
    /// A missing file is a cold start with no session. A file older than
    /// `max_age` is deleted and treated the same way.
    pub async fn load(path: PathBuf, max_age: Duration) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let persisted: Persisted = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;

            let age_millis = now_millis().saturating_sub(persisted.stored_at);
            if u128::from(age_millis) > max_age.as_millis() {
                info!(path = %path.display(), "persisted credential expired, discarding");
                remove_file(&path).await?;
                None
            } else {
                info!(path = %path.display(), role = %persisted.credential.role, "loaded credential");
                Some(persisted.credential)
            }
        } else {
            info!(path = %path.display(), "credential file not found, starting without a session");
            None
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Clone of the current credential.
    pub async fn get(&self) -> Option<Credential> {
        self.state.lock().await.clone()
    }

    /// Current access token, re-read on every call.
    pub async fn access_token(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|c| c.access.clone())
    }

    /// Current refresh token.
    pub async fn refresh_token(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|c| c.refresh.clone())
    }

    /// Replace the credential (login).
    ///
    /// Persists first, then swaps the in-memory value, so a failed write
    /// leaves the previous credential in place and returns the error.
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            write_atomic(path, &credential).await?;
        }
        debug!(role = %credential.role, "stored credential");
        *state = Some(credential);
        Ok(())
    }

    /// Apply a refreshed token pair if the store still holds `expected_refresh`.
    ///
    /// Returns the updated credential, or `None` when the store was cleared or
    /// replaced while the refresh was in flight (the result is stale and must
    /// not overwrite the newer credential). A `None` refresh keeps the current
    /// refresh token.
    pub async fn rotate(
        &self,
        expected_refresh: &str,
        access: String,
        refresh: Option<String>,
    ) -> Result<Option<Credential>> {
        let mut state = self.state.lock().await;
        let Some(current) = state.as_ref() else {
            debug!("credential cleared during refresh, discarding rotation");
            return Ok(None);
        };
        if current.refresh != expected_refresh {
            debug!("credential replaced during refresh, discarding rotation");
            return Ok(None);
        }

        let mut updated = current.clone();
        updated.access = access;
        if let Some(refresh) = refresh {
            updated.refresh = refresh;
        }

        if let Some(path) = &self.path {
            write_atomic(path, &updated).await?;
        }
        *state = Some(updated.clone());
        debug!("rotated credential");
        Ok(Some(updated))
    }

    /// Remove the credential (logout, invalidation).
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            remove_file(path).await?;
        }
        if state.take().is_some() {
            debug!("cleared credential");
        }
        Ok(())
    }

    /// Clear the credential only if it still holds `expected_refresh`.
    ///
    /// Returns whether anything was cleared. Used after a failed refresh so a
    /// concurrent re-login is not wiped.
    pub async fn invalidate(&self, expected_refresh: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let matches = state
            .as_ref()
            .is_some_and(|c| c.refresh == expected_refresh);
        if !matches {
            return Ok(false);
        }
        if let Some(path) = &self.path {
            remove_file(path).await?;
        }
        *state = None;
        debug!("invalidated credential");
        Ok(true)
    }

    /// Whether no credential is held.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_none()
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write the credential to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets 0600 permissions since the file contains tokens.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let persisted = Persisted {
        credential: credential.clone(),
        stored_at: now_millis(),
    };
    let json = serde_json::to_string_pretty(&persisted)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to remove credential file");
            Err(Error::Io(format!("removing credential file: {e}")))
        }
    }
}
