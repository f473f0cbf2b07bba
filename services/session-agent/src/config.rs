//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The login password is loaded from SESSION_PASSWORD or password_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use identity::Role;
use realtime::{Backoff, ConnectionConfig, DEFAULT_DEDUP_CAPACITY};
use serde::Deserialize;
use session_guard::{GuardConfig, VerifyTarget};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub realtime: RealtimeConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub login: Option<LoginConfig>,
}

/// Identity provider endpoint
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Credential persistence and session timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Credential file; the session is kept in memory only when unset
    pub credentials_path: Option<PathBuf>,
    pub expiry_horizon_secs: u64,
    pub poll_interval_secs: u64,
    pub verify: VerifyTarget,
    pub max_age_secs: u64,
}

/// Realtime channel endpoint and retry policy
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    pub url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

/// HTTP listener and required roles
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Roles allowed to run the agent; empty admits any role
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Blacklist the refresh token when the agent stops
    #[serde(default)]
    pub logout_on_shutdown: bool,
}

/// Credentials used when no persisted session exists
#[derive(Debug, Deserialize)]
pub struct LoginConfig {
    pub username: String,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    /// Path to a file containing the password (alternative to SESSION_PASSWORD env var)
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            expiry_horizon_secs: session_auth::EXPIRY_HORIZON.as_secs(),
            poll_interval_secs: session_auth::SESSION_POLL_INTERVAL.as_secs(),
            verify: VerifyTarget::default(),
            max_age_secs: session_auth::CREDENTIAL_MAX_AGE.as_secs(),
        }
    }
}

fn default_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive() -> u64 {
    30
}

fn default_base_backoff() -> u64 {
    5_000
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_dedup_capacity() -> usize {
    DEFAULT_DEDUP_CAPACITY
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Password resolution order:
    /// 1. SESSION_PASSWORD env var
    /// 2. password_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Some(login) = config.login.as_mut() {
            if let Ok(password) = std::env::var("SESSION_PASSWORD") {
                login.password = Some(Secret::new(password));
            } else if let Some(ref password_file) = login.password_file {
                let password = std::fs::read_to_string(password_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read password_file {}: {e}",
                        password_file.display()
                    ))
                })?;
                let password = password.trim().to_owned();
                if !password.is_empty() {
                    login.password = Some(Secret::new(password));
                }
            }

            if login.password.is_none() {
                return Err(common::Error::Config(format!(
                    "no password for login user {}: set SESSION_PASSWORD or password_file",
                    login.username
                )));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let base_url = &self.identity.base_url;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(common::Error::InvalidUrl {
                url: base_url.clone(),
                reason: "expected http:// or https://".into(),
            });
        }

        self.realtime.endpoint()?;

        let non_zero = [
            ("identity.timeout_secs", self.identity.timeout_secs),
            ("session.expiry_horizon_secs", self.session.expiry_horizon_secs),
            ("session.poll_interval_secs", self.session.poll_interval_secs),
            ("session.max_age_secs", self.session.max_age_secs),
            ("realtime.connect_timeout_secs", self.realtime.connect_timeout_secs),
            ("realtime.keepalive_secs", self.realtime.keepalive_secs),
            ("realtime.base_backoff_ms", self.realtime.base_backoff_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(common::Error::Config(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.realtime.max_attempts == 0 {
            return Err(common::Error::Config(
                "realtime.max_attempts must be at least 1".into(),
            ));
        }

        if self.realtime.max_backoff_ms < self.realtime.base_backoff_ms {
            return Err(common::Error::Config(format!(
                "realtime.max_backoff_ms ({}) must not be below base_backoff_ms ({})",
                self.realtime.max_backoff_ms, self.realtime.base_backoff_ms
            )));
        }

        if self.agent.max_connections == 0 {
            return Err(common::Error::Config(
                "agent.max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-agent.toml")
    }

    pub fn guard_config(&self) -> GuardConfig {
        GuardConfig {
            expiry_horizon: Duration::from_secs(self.session.expiry_horizon_secs),
            poll_interval: Duration::from_secs(self.session.poll_interval_secs),
            verify: self.session.verify,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.realtime.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(self.realtime.keepalive_secs),
            backoff: Backoff {
                base: Duration::from_millis(self.realtime.base_backoff_ms),
                cap: Duration::from_millis(self.realtime.max_backoff_ms),
                max_attempts: self.realtime.max_attempts,
            },
        }
    }
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl RealtimeConfig {
    /// Parsed channel URL; only `ws://` and `wss://` are accepted.
    pub fn endpoint(&self) -> common::Result<Url> {
        let url = Url::parse(&self.url).map_err(|e| common::Error::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(common::Error::InvalidUrl {
                url: self.url.clone(),
                reason: format!("expected ws:// or wss://, got {other}://"),
            }),
        }
    }
}
