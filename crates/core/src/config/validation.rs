//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

fn check_timeout(field: &str, value: u64) -> Result<(), ConfigError> {
    if value < 100 {
        return Err(ConfigError::Invalid { field: field.into(), reason: "must be at least 100ms".into() });
    }
    if value > 300_000 {
        return Err(ConfigError::Invalid {
            field: field.into(),
            reason: "must not exceed 5 minutes (300000ms)".into(),
        });
    }
    Ok(())
}

fn check_absolute(field: &str, value: &str) -> Result<(), ConfigError> {
    if !value.starts_with('/') {
        return Err(ConfigError::Invalid { field: field.into(), reason: format!("'{value}' must start with '/'") });
    }
    Ok(())
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `max_cache_entries`, `chunk_size` is 0
    /// - a timeout is below 100ms or above 5 minutes
    /// - `origin` is not an http(s) URL
    /// - a route path is not absolute
    ///
    /// Returns `ConfigError::Missing` if `worker_command` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_entries == 0 {
            return Err(ConfigError::Invalid {
                field: "max_cache_entries".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid { field: "chunk_size".into(), reason: "must be greater than 0".into() });
        }

        check_timeout("call_timeout_ms", self.call_timeout_ms)?;
        check_timeout("fetch_timeout_ms", self.fetch_timeout_ms)?;

        if !(self.origin.starts_with("http://") || self.origin.starts_with("https://")) {
            return Err(ConfigError::Invalid { field: "origin".into(), reason: "must be an http(s) URL".into() });
        }

        check_absolute("version_path", &self.version_path)?;
        check_absolute("app_shell_path", &self.app_shell_path)?;
        check_absolute("offline_path", &self.offline_path)?;
        check_absolute("static_prefix", &self.static_prefix)?;
        for url in &self.precache_urls {
            check_absolute("precache_urls", url)?;
        }

        if self.user_agent.is_empty() {
            return Err(ConfigError::Invalid { field: "user_agent".into(), reason: "must not be empty".into() });
        }

        if self.worker_command.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "worker_command".into(),
                hint: "Set POSA_WORKER_COMMAND to the posa-worker binary".into(),
            });
        }

        if !self.precache_urls.contains(&self.offline_path) {
            tracing::warn!(
                offline_path = %self.offline_path,
                "offline page is not precached; navigation fallback will skip it until fetched"
            );
        }

        Ok(())
    }
}
