//! Runtime configuration.

use std::time::Duration;

use runtime_core::MAX_LOCK_TTL_MS;
use thiserror::Error;

/// Tunables shared by the supervisor, the event store and job controllers.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// TTL applied to locks taken while the event store processes an event.
    pub lock_ttl_ms: Option<u64>,
    /// Timeout for remote calls that never block on data.
    pub call_timeout: Option<Duration>,
    /// Interval of the event store housekeeping tick.
    pub housekeeping_interval: Duration,
    /// Log level for binaries hosting the runtime.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: Some(30_000),
            call_timeout: Some(Duration::from_secs(5)),
            housekeeping_interval: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `RUNTIME_LOCK_TTL_MS`: lock TTL in milliseconds, `0` disables expiry
    /// - `RUNTIME_CALL_TIMEOUT_MS`: remote call timeout, `0` disables it
    /// - `RUNTIME_HOUSEKEEPING_SECS`: event store tick interval
    /// - `RUNTIME_LOG_LEVEL`: `trace`, `debug`, `info`, `warn` or `error`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ttl) = parse_u64(&lookup, "RUNTIME_LOCK_TTL_MS")? {
            if ttl > MAX_LOCK_TTL_MS {
                return Err(ConfigError::Invalid {
                    key: "RUNTIME_LOCK_TTL_MS".into(),
                    value: ttl.to_string(),
                });
            }
            config.lock_ttl_ms = (ttl > 0).then_some(ttl);
        }
        if let Some(timeout) = parse_u64(&lookup, "RUNTIME_CALL_TIMEOUT_MS")? {
            config.call_timeout = (timeout > 0).then(|| Duration::from_millis(timeout));
        }
        if let Some(secs) = parse_u64(&lookup, "RUNTIME_HOUSEKEEPING_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: "RUNTIME_HOUSEKEEPING_SECS".into(),
                    value: secs.to_string(),
                });
            }
            config.housekeeping_interval = Duration::from_secs(secs);
        }
        if let Some(level) = lookup("RUNTIME_LOG_LEVEL") {
            let level = level.to_lowercase();
            if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
                return Err(ConfigError::Invalid {
                    key: "RUNTIME_LOG_LEVEL".into(),
                    value: level,
                });
            }
            config.log_level = level;
        }

        Ok(config)
    }

    /// Set the event lock TTL.
    pub fn with_lock_ttl_ms(mut self, ttl_ms: Option<u64>) -> Self {
        self.lock_ttl_ms = ttl_ms;
        self
    }

    /// Set the remote call timeout.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the housekeeping interval.
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    Invalid { key: String, value: String },
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            ("RUNTIME_LOCK_TTL_MS", "0"),
            ("RUNTIME_CALL_TIMEOUT_MS", "250"),
            ("RUNTIME_LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();
        assert_eq!(config.lock_ttl_ms, None);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn invalid_values_fail() {
        let err = RuntimeConfig::from_lookup(lookup(&[("RUNTIME_LOCK_TTL_MS", "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RUNTIME_LOCK_TTL_MS".into(),
                value: "soon".into()
            }
        );
        assert!(RuntimeConfig::from_lookup(lookup(&[("RUNTIME_LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn oversized_lock_ttl_fails() {
        let max = u64::MAX.to_string();
        let err = RuntimeConfig::from_lookup(lookup(&[("RUNTIME_LOCK_TTL_MS", max.as_str())]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RUNTIME_LOCK_TTL_MS".into(),
                value: max
            }
        );

        let limit = MAX_LOCK_TTL_MS.to_string();
        let config =
            RuntimeConfig::from_lookup(lookup(&[("RUNTIME_LOCK_TTL_MS", limit.as_str())])).unwrap();
        assert_eq!(config.lock_ttl_ms, Some(MAX_LOCK_TTL_MS));
    }
}
