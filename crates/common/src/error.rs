//! Configuration error types shared by the session crates

use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("max_attempts must be at least 1".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: max_attempts must be at least 1"
        );

        let url_err = Error::InvalidUrl {
            url: "ftp://example".into(),
            reason: "expected ws:// or wss://".into(),
        };
        assert!(url_err.to_string().contains("ftp://example"));
        assert!(url_err.to_string().contains("expected ws://"));
    }

    #[test]
    fn io_error_converts() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "password file missing").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
    }
}
