//! Process configuration loaded from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `JWT_SECRET` | required, base64, at least 32 decoded bytes |
//! | `JWT_EXPIRES_IN` | `86400` seconds |
//! | `TX_TIMEOUT_MS` | `5000` |
//! | `TX_MAX_RETRIES` | `3` retries after the first attempt |
//! | `NOTIFIER_ENABLED` | `true` |
//! | `NOTIFIER_WEBHOOK_URL` | unset (log delivery) |
//! | `DATABASE_PATH` | `peditos.db` |
//! | `AUDIT_STDOUT` | `true` |
//! | `PORT` | `8080` |

use crate::error::QueueError;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 86_400;
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_TX_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Anything that stops the server from coming up.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("order store: {0}")]
    Store(#[from] QueueError),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Base64 signing key, decoded by [`crate::auth::JwtService::from_base64_secret`].
    pub jwt_secret: String,
    pub token_lifetime_secs: u64,
    pub tx_timeout: Duration,
    pub tx_max_retries: u32,
    pub notifier_enabled: bool,
    pub notifier_webhook_url: Option<String>,
    pub database_path: String,
    pub audit_stdout: bool,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any name → value lookup. `from_env` passes `std::env::var`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let tx_timeout_ms: u64 = parse_or(&lookup, "TX_TIMEOUT_MS", DEFAULT_TX_TIMEOUT.as_millis() as u64)?;
        let tx_max_retries: u32 = parse_or(&lookup, "TX_MAX_RETRIES", DEFAULT_TX_MAX_RETRIES)?;

        Ok(Self {
            jwt_secret,
            token_lifetime_secs: parse_or(&lookup, "JWT_EXPIRES_IN", DEFAULT_TOKEN_LIFETIME_SECS)?,
            tx_timeout: Duration::from_millis(tx_timeout_ms),
            tx_max_retries,
            notifier_enabled: flag_or(&lookup, "NOTIFIER_ENABLED", true)?,
            notifier_webhook_url: lookup("NOTIFIER_WEBHOOK_URL").filter(|s| !s.trim().is_empty()),
            database_path: lookup("DATABASE_PATH").unwrap_or_else(|| "peditos.db".to_string()),
            audit_stdout: flag_or(&lookup, "AUDIT_STDOUT", true)?,
            port: parse_or(&lookup, "PORT", 8080)?,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn flag_or(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            v if v.eq_ignore_ascii_case("true") => Ok(true),
            v if v.eq_ignore_ascii_case("false") => Ok(false),
            _ => Err(ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: "expected true/false".into(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = Config::from_lookup(lookup(&[("JWT_SECRET", "c2VjcmV0")])).unwrap();
        assert_eq!(config.token_lifetime_secs, 86_400);
        assert_eq!(config.tx_timeout, Duration::from_secs(5));
        assert_eq!(config.tx_max_retries, 3);
        assert!(config.notifier_enabled);
        assert!(config.notifier_webhook_url.is_none());
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("JWT_SECRET")));
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "x"), ("TX_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("TX_TIMEOUT_MS"));

        let err = Config::from_lookup(lookup(&[("JWT_SECRET", "x"), ("NOTIFIER_ENABLED", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("NOTIFIER_ENABLED"));
    }

    #[test]
    fn zero_retries_means_a_single_attempt() {
        let config = Config::from_lookup(lookup(&[("JWT_SECRET", "x"), ("TX_MAX_RETRIES", "0")])).unwrap();
        assert_eq!(config.tx_max_retries, 0);
    }

    #[test]
    fn flags_accept_numeric_and_word_forms() {
        let config = Config::from_lookup(lookup(&[
            ("JWT_SECRET", "x"),
            ("NOTIFIER_ENABLED", "0"),
            ("AUDIT_STDOUT", "FALSE"),
        ]))
        .unwrap();
        assert!(!config.notifier_enabled);
        assert!(!config.audit_stdout);
    }
}
