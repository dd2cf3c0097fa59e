//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (POSA_*)
//! 2. TOML config file (if POSA_CONFIG_FILE set)
//! 3. Built-in defaults

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Environment variable naming the TOML config file.
pub const CONFIG_FILE_VAR: &str = "POSA_CONFIG_FILE";

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (POSA_*)
/// 2. TOML config file (if POSA_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root directory for every local persistence layer.
    ///
    /// Set via POSA_DATA_DIR environment variable.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Origin of the application server (scheme, host, port).
    ///
    /// Set via POSA_ORIGIN environment variable.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Path of the build version descriptor on the origin.
    #[serde(default = "default_version_path")]
    pub version_path: String,

    /// Prefix of every response-cache namespace name.
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,

    /// Generation used when the version descriptor is unavailable.
    #[serde(default = "default_generation")]
    pub default_generation: String,

    /// Paths fetched into the namespace at install time.
    #[serde(default = "default_precache_urls")]
    pub precache_urls: Vec<String>,

    /// Cached document served when a navigation has no better fallback.
    #[serde(default = "default_app_shell_path")]
    pub app_shell_path: String,

    /// Offline fallback page.
    #[serde(default = "default_offline_path")]
    pub offline_path: String,

    /// Path prefix of the application's own static assets.
    #[serde(default = "default_static_prefix")]
    pub static_prefix: String,

    /// Maximum number of entries in one cache namespace.
    ///
    /// Set via POSA_MAX_CACHE_ENTRIES environment variable.
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    /// Deadline for one Message Channel call in milliseconds.
    ///
    /// Set via POSA_CALL_TIMEOUT_MS environment variable.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via POSA_FETCH_TIMEOUT_MS environment variable.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Records committed per transaction during bulk upserts.
    ///
    /// Set via POSA_CHUNK_SIZE environment variable.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Largest serialized value mirrored into local storage.
    #[serde(default = "default_mirror_max_bytes")]
    pub mirror_max_bytes: usize,

    /// Program started as the record store's background process.
    ///
    /// Set via POSA_WORKER_COMMAND environment variable.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./posa-data")
}

fn default_origin() -> String {
    "http://localhost:8000".into()
}

fn default_version_path() -> String {
    "/assets/posawesome/dist/js/version.json".into()
}

fn default_cache_prefix() -> String {
    "posawesome-cache-".into()
}

fn default_generation() -> String {
    "default".into()
}

fn default_precache_urls() -> Vec<String> {
    [
        "/app/posapp",
        "/assets/posawesome/dist/js/posawesome.umd.js",
        "/assets/posawesome/dist/js/offline/index.js",
        "/assets/posawesome/dist/js/posapp/workers/itemWorker.js",
        "/manifest.json",
        "/offline.html",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_app_shell_path() -> String {
    "/app/posapp".into()
}

fn default_offline_path() -> String {
    "/offline.html".into()
}

fn default_static_prefix() -> String {
    "/assets/posawesome/".into()
}

fn default_max_cache_entries() -> usize {
    1000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_fetch_timeout_ms() -> u64 {
    20_000
}

fn default_user_agent() -> String {
    "posa-offline/0.1".into()
}

fn default_chunk_size() -> usize {
    1000
}

fn default_mirror_max_bytes() -> usize {
    256 * 1024
}

fn default_worker_command() -> String {
    "posa-worker".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            origin: default_origin(),
            version_path: default_version_path(),
            cache_prefix: default_cache_prefix(),
            default_generation: default_generation(),
            precache_urls: default_precache_urls(),
            app_shell_path: default_app_shell_path(),
            offline_path: default_offline_path(),
            static_prefix: default_static_prefix(),
            max_cache_entries: default_max_cache_entries(),
            call_timeout_ms: default_call_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            user_agent: default_user_agent(),
            chunk_size: default_chunk_size(),
            mirror_max_bytes: default_mirror_max_bytes(),
            worker_command: default_worker_command(),
        }
    }
}

impl AppConfig {
    /// Message Channel deadline as Duration.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// HTTP timeout as Duration for use with reqwest/tokio.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// SQLite file of the Background Record Store.
    pub fn record_db_path(&self) -> PathBuf {
        self.databases_dir().join("posawesome_offline.sqlite")
    }

    /// Directory enumerated by the purge's database class.
    pub fn databases_dir(&self) -> PathBuf {
        self.data_dir.join("databases")
    }

    /// SQLite file backing local (persistent) key/value storage.
    pub fn local_storage_path(&self) -> PathBuf {
        self.data_dir.join("local_storage.sqlite")
    }

    /// SQLite file holding the response-cache namespaces.
    pub fn cache_storage_path(&self) -> PathBuf {
        self.data_dir.join("cache_storage.sqlite")
    }

    /// Environment overrides that make a record store worker resolve the
    /// same data directory and store settings as this configuration.
    pub fn worker_env(&self) -> Vec<(&'static str, OsString)> {
        vec![
            ("POSA_DATA_DIR", self.data_dir.clone().into_os_string()),
            ("POSA_CHUNK_SIZE", self.chunk_size.to_string().into()),
            ("POSA_MIRROR_MAX_BYTES", self.mirror_max_bytes.to_string().into()),
        ]
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `POSA_`
    /// 2. TOML file from `POSA_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file or environment cannot be parsed,
    /// or if validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(std::env::var_os(CONFIG_FILE_VAR).map(PathBuf::from).as_deref())
    }

    /// Like [`Self::load`], with the TOML file given explicitly.
    pub fn load_from(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_path) = config_file {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(
            Env::prefixed("POSA_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./posa-data"));
        assert_eq!(config.cache_prefix, "posawesome-cache-");
        assert_eq!(config.default_generation, "default");
        assert_eq!(config.max_cache_entries, 1000);
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.call_timeout_ms, 10_000);
        assert!(config.precache_urls.contains(&"/offline.html".to_string()));
        assert!(config.precache_urls.contains(&"/manifest.json".to_string()));
    }

    #[test]
    fn test_timeouts() {
        let config = AppConfig::default();
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetch_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_derived_paths() {
        let config = AppConfig { data_dir: PathBuf::from("/tmp/posa"), ..Default::default() };
        assert_eq!(config.databases_dir(), PathBuf::from("/tmp/posa/databases"));
        assert!(config.record_db_path().starts_with("/tmp/posa/databases"));
        assert_eq!(config.local_storage_path(), PathBuf::from("/tmp/posa/local_storage.sqlite"));
        assert_eq!(config.cache_storage_path(), PathBuf::from("/tmp/posa/cache_storage.sqlite"));
    }

    #[test]
    fn test_load_from_toml_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("posa.toml", "chunk_size = 250\norigin = \"http://till.local:8000\"\n")?;

            let config = AppConfig::load_from(Some(Path::new("posa.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.chunk_size, 250);
            assert_eq!(config.origin, "http://till.local:8000");
            assert_eq!(config.cache_prefix, "posawesome-cache-");
            Ok(())
        });
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("posa.toml", "max_cache_entries = 0\n")?;
            assert!(AppConfig::load_from(Some(Path::new("posa.toml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("posa.toml", "chunk_size = 250\n")?;
            jail.set_env("POSA_CHUNK_SIZE", 40);

            let config = AppConfig::load_from(Some(Path::new("posa.toml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.chunk_size, 40);
            Ok(())
        });
    }

    #[test]
    fn test_worker_env_resolves_same_settings() {
        let parent = AppConfig {
            data_dir: PathBuf::from("/srv/till/configured"),
            chunk_size: 250,
            mirror_max_bytes: 4096,
            ..Default::default()
        };

        Jail::expect_with(|jail| {
            jail.clear_env();
            for (key, value) in parent.worker_env() {
                jail.set_env(key, value.to_string_lossy());
            }

            let worker = AppConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(worker.data_dir, parent.data_dir);
            assert_eq!(worker.record_db_path(), parent.record_db_path());
            assert_eq!(worker.local_storage_path(), parent.local_storage_path());
            assert_eq!(worker.chunk_size, 250);
            assert_eq!(worker.mirror_max_bytes, 4096);
            Ok(())
        });
    }
}
