//! Process-level tunables loaded from the environment: default lock
//! timeouts, retry bounds, and cache capacities that callers would
//! otherwise have to thread through every `Hub`/`Coordinator` constructor.
//!
//! Mirrors the `FromEnv` / `env_var*` pattern the rest of the stack uses for
//! configuration, just scoped to this crate instead of a generic DI
//! container.

use std::fmt;
use std::time::Duration;

/// Failure loading a config value from the environment.
#[derive(Debug)]
pub enum ConfigError {
    Missing(String),
    Invalid { name: String, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "environment variable '{name}' not set"),
            ConfigError::Invalid { name, reason } => {
                write!(f, "environment variable '{name}' invalid: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Types that can be constructed entirely from environment variables.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

pub fn env_var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

pub fn env_var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

pub fn env_var_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid { name: name.to_string(), reason: e.to_string() }),
    }
}

fn env_var_duration_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: u64 = env_var_parse(name, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

/// Tunables consulted by the hub and coordinator when a blueprint or plan
/// node doesn't pin its own value.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    pub default_lock_timeout: Duration,
    pub default_start_timeout: Duration,
    pub default_stop_timeout: Duration,
    pub default_retry_max_attempts: u32,
    pub action_cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout: Duration::from_secs(5),
            default_start_timeout: Duration::from_secs(10),
            default_stop_timeout: Duration::from_secs(10),
            default_retry_max_attempts: 1,
            action_cache_capacity: 4096,
        }
    }
}

impl FromEnv for RuntimeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();
        Ok(Self {
            default_lock_timeout: env_var_duration_secs("DEVICEHUB_LOCK_TIMEOUT_SECS", default.default_lock_timeout)?,
            default_start_timeout: env_var_duration_secs("DEVICEHUB_START_TIMEOUT_SECS", default.default_start_timeout)?,
            default_stop_timeout: env_var_duration_secs("DEVICEHUB_STOP_TIMEOUT_SECS", default.default_stop_timeout)?,
            default_retry_max_attempts: env_var_parse("DEVICEHUB_RETRY_MAX_ATTEMPTS", default.default_retry_max_attempts)?,
            action_cache_capacity: env_var_parse("DEVICEHUB_ACTION_CACHE_CAPACITY", default.action_cache_capacity)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        std::env::remove_var("DEVICEHUB_LOCK_TIMEOUT_SECS_TEST_UNUSED");
        let config = RuntimeConfig::default();
        assert_eq!(config.default_lock_timeout, Duration::from_secs(5));
        assert_eq!(config.default_retry_max_attempts, 1);
    }

    #[test]
    fn env_var_parse_rejects_malformed_value() {
        std::env::set_var("DEVICEHUB_TEST_BAD_NUMBER", "not-a-number");
        let result: Result<u32, ConfigError> = env_var_parse("DEVICEHUB_TEST_BAD_NUMBER", 1);
        std::env::remove_var("DEVICEHUB_TEST_BAD_NUMBER");
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn env_var_parse_falls_back_to_default_when_unset() {
        std::env::remove_var("DEVICEHUB_TEST_UNSET_NUMBER");
        let result: Result<u32, ConfigError> = env_var_parse("DEVICEHUB_TEST_UNSET_NUMBER", 7);
        assert_eq!(result.unwrap(), 7);
    }
}
