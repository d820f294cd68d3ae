//! Host configuration, passed explicitly to every component.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Prefix of every task handler path.
    pub base_path: String,
    /// Prefix of every entity kind in the store.
    pub datastore_prefix: String,
    /// Log every orchestration step at debug level.
    pub log_verbose: bool,
    /// Optimistic transaction attempts before giving up.
    pub transaction_attempts: u32,
    /// Queue used when a delivery does not name one.
    pub default_queue: String,
    /// How long a lock holder may run before its lease can be taken over.
    pub lease_timeout: Duration,
    /// Attempts allowed per lock step (acquisitions plus takeovers).
    pub max_lock_retries: u32,
    /// Namespaces enumerated per iterator delivery.
    pub iterator_page_size: usize,
    /// Redelivery backoff used by the embedded task runner.
    pub retry: RetryPolicy,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            base_path: "/_mapper".to_string(),
            datastore_prefix: String::new(),
            log_verbose: false,
            transaction_attempts: 10,
            default_queue: "default".to_string(),
            lease_timeout: Duration::from_secs(600),
            max_lock_retries: 10,
            iterator_page_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl MapperConfig {
    /// Read `SHARDMAP_*` environment variables over the defaults.
    ///
    /// | variable | field |
    /// |----------|-------|
    /// | `SHARDMAP_BASE_PATH` | `base_path` |
    /// | `SHARDMAP_DATASTORE_PREFIX` | `datastore_prefix` |
    /// | `SHARDMAP_LOG_VERBOSE` | `log_verbose` |
    /// | `SHARDMAP_TRANSACTION_ATTEMPTS` | `transaction_attempts` |
    /// | `SHARDMAP_DEFAULT_QUEUE` | `default_queue` |
    /// | `SHARDMAP_LEASE_TIMEOUT_SECS` | `lease_timeout` |
    /// | `SHARDMAP_MAX_LOCK_RETRIES` | `max_lock_retries` |
    /// | `SHARDMAP_ITERATOR_PAGE_SIZE` | `iterator_page_size` |
    /// | `SHARDMAP_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            base_path: lookup("SHARDMAP_BASE_PATH").unwrap_or(defaults.base_path),
            datastore_prefix: lookup("SHARDMAP_DATASTORE_PREFIX").unwrap_or(defaults.datastore_prefix),
            log_verbose: parse(&lookup, "SHARDMAP_LOG_VERBOSE", defaults.log_verbose)?,
            transaction_attempts: parse(
                &lookup,
                "SHARDMAP_TRANSACTION_ATTEMPTS",
                defaults.transaction_attempts,
            )?,
            default_queue: lookup("SHARDMAP_DEFAULT_QUEUE").unwrap_or(defaults.default_queue),
            lease_timeout: Duration::from_secs(parse(
                &lookup,
                "SHARDMAP_LEASE_TIMEOUT_SECS",
                defaults.lease_timeout.as_secs(),
            )?),
            max_lock_retries: parse(&lookup, "SHARDMAP_MAX_LOCK_RETRIES", defaults.max_lock_retries)?,
            iterator_page_size: parse(
                &lookup,
                "SHARDMAP_ITERATOR_PAGE_SIZE",
                defaults.iterator_page_size,
            )?,
            retry: RetryPolicy {
                max_attempts: parse(
                    &lookup,
                    "SHARDMAP_RETRY_MAX_ATTEMPTS",
                    defaults.retry.max_attempts,
                )?,
                ..defaults.retry
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.is_empty() && !self.base_path.starts_with('/') {
            return Err(invalid("base_path", "must start with '/'"));
        }
        if self.base_path.ends_with('/') {
            return Err(invalid("base_path", "must not end with '/'"));
        }
        if self.transaction_attempts == 0 {
            return Err(invalid("transaction_attempts", "must be at least 1"));
        }
        if self.max_lock_retries == 0 {
            return Err(invalid("max_lock_retries", "must be at least 1"));
        }
        if self.iterator_page_size == 0 {
            return Err(invalid("iterator_page_size", "must be at least 1"));
        }
        if self.default_queue.is_empty() {
            return Err(invalid("default_queue", "must not be empty"));
        }
        // a crashed holder is only replaced once its lease expires; redelivery
        // of its step must still be going by then
        if self.retry.redelivery_window() <= self.lease_timeout {
            return Err(ConfigError::Invalid {
                var: "retry".to_string(),
                message: format!(
                    "redelivery window {:?} must outlast lease_timeout {:?}",
                    self.retry.redelivery_window(),
                    self.lease_timeout
                ),
            });
        }
        Ok(())
    }

    /// Full handler path for a route relative to `base_path`.
    pub fn path(&self, route: &str) -> String {
        format!("{}{route}", self.base_path)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout).unwrap_or_else(|_| chrono::Duration::days(3650))
    }

    /// Queue for follow-up tasks of a delivery that arrived on `queue`.
    pub fn queue_or_default<'a>(&'a self, queue: &'a str) -> &'a str {
        if queue.is_empty() {
            &self.default_queue
        } else {
            queue
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_datastore_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.datastore_prefix = prefix.into();
        self
    }

    pub fn with_iterator_page_size(mut self, size: usize) -> Self {
        self.iterator_page_size = size;
        self
    }

    pub fn with_max_lock_retries(mut self, retries: u32) -> Self {
        self.max_lock_retries = retries;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_verbose(mut self, verbose: bool) -> Self {
        self.log_verbose = verbose;
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn invalid(var: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = MapperConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, MapperConfig::default());
        assert_eq!(config.path("/shard"), "/_mapper/shard");
    }

    #[test]
    fn env_overrides_defaults() {
        let config = MapperConfig::from_lookup(lookup(&[
            ("SHARDMAP_BASE_PATH", "/tasks"),
            ("SHARDMAP_DATASTORE_PREFIX", "MP_"),
            ("SHARDMAP_LOG_VERBOSE", "true"),
            ("SHARDMAP_LEASE_TIMEOUT_SECS", "30"),
            ("SHARDMAP_ITERATOR_PAGE_SIZE", "5"),
        ]))
        .unwrap();

        assert_eq!(config.path("/iterate"), "/tasks/iterate");
        assert_eq!(config.datastore_prefix, "MP_");
        assert!(config.log_verbose);
        assert_eq!(config.lease(), chrono::Duration::seconds(30));
        assert_eq!(config.iterator_page_size, 5);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = MapperConfig::from_lookup(lookup(&[("SHARDMAP_MAX_LOCK_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("SHARDMAP_MAX_LOCK_RETRIES"));

        assert!(MapperConfig::from_lookup(lookup(&[("SHARDMAP_ITERATOR_PAGE_SIZE", "0")])).is_err());
        assert!(MapperConfig::from_lookup(lookup(&[("SHARDMAP_BASE_PATH", "tasks")])).is_err());
    }

    #[test]
    fn retry_window_must_outlast_the_lease() {
        let err = MapperConfig::from_lookup(lookup(&[("SHARDMAP_RETRY_MAX_ATTEMPTS", "20")])).unwrap_err();
        assert!(err.to_string().contains("lease_timeout"));

        assert!(MapperConfig::from_lookup(lookup(&[("SHARDMAP_LEASE_TIMEOUT_SECS", "3600")])).is_err());
        let config = MapperConfig::from_lookup(lookup(&[
            ("SHARDMAP_LEASE_TIMEOUT_SECS", "3600"),
            ("SHARDMAP_RETRY_MAX_ATTEMPTS", "200"),
        ]))
        .unwrap();
        assert_eq!(config.retry.max_attempts, 200);
    }

    #[test]
    fn empty_queue_falls_back_to_default() {
        let config = MapperConfig::default();
        assert_eq!(config.queue_or_default(""), "default");
        assert_eq!(config.queue_or_default("bulk"), "bulk");
    }
}
