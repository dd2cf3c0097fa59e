//! Bulk cache purge.
//!
//! Clears every local persistence layer: local key/value storage, session
//! key/value storage, record store database files, and response-cache
//! namespaces. Each enabled class is cleared concurrently and independently;
//! one class failing never stops the others, and the report says which
//! classes were cleared and which failed.

use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::cache::CacheStorage;
use crate::kv::KeyValueStore;

/// Prompt shown before anything is cleared.
pub const CONFIRM_PROMPT: &str = "Clear all offline data? Unsynced invoices and cached catalogs will be lost.";

/// One class of local persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    LocalStorage,
    SessionStorage,
    Databases,
    Caches,
}

impl StorageClass {
    pub const ALL: [StorageClass; 4] =
        [StorageClass::LocalStorage, StorageClass::SessionStorage, StorageClass::Databases, StorageClass::Caches];

    pub fn as_str(self) -> &'static str {
        match self {
            StorageClass::LocalStorage => "local_storage",
            StorageClass::SessionStorage => "session_storage",
            StorageClass::Databases => "databases",
            StorageClass::Caches => "caches",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let wanted = s.trim().replace('-', "_").to_ascii_lowercase();
        StorageClass::ALL
            .into_iter()
            .find(|class| class.as_str() == wanted)
            .ok_or_else(|| Error::InvalidInput(format!("unknown storage class '{s}'")))
    }
}

/// Which classes to clear and how narrowly.
///
/// `None` for a `specific_*` list means everything in that class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeOptions {
    /// Ask a [`Confirm`] implementation first.
    pub confirm: bool,
    pub skip: Vec<StorageClass>,
    /// Keys to remove from both key/value classes.
    pub specific_keys: Option<Vec<String>>,
    /// Database names under the databases directory, with or without extension.
    pub specific_databases: Option<Vec<String>>,
    pub specific_caches: Option<Vec<String>>,
}

/// Interactive gate in front of a purge.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Outcome of one purge run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// The confirmation was declined and nothing was touched.
    pub declined: bool,
    pub cleared: Vec<StorageClass>,
    pub skipped: Vec<StorageClass>,
    pub failed: Vec<(StorageClass, String)>,
}

impl PurgeReport {
    fn declined() -> Self {
        Self { declined: true, ..Default::default() }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turn a partially failed report into `PURGE_FAILED` naming every class.
    pub fn into_result(self) -> Result<Self, Error> {
        if self.is_success() {
            return Ok(self);
        }
        let failed: Vec<String> = self.failed.iter().map(|(class, reason)| format!("{class} ({reason})")).collect();
        let cleared: Vec<&str> = self.cleared.iter().map(|c| c.as_str()).collect();
        Err(Error::PurgeFailed(format!(
            "failed: {}; cleared: {}",
            failed.join(", "),
            if cleared.is_empty() { "none".to_string() } else { cleared.join(", ") }
        )))
    }
}

/// SQLite database files of one directory.
#[derive(Debug, Clone)]
pub struct DatabaseDir {
    dir: PathBuf,
}

const SIDE_FILE_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

impl DatabaseDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Database names (file stems of `*.sqlite`), sorted. A missing directory has none.
    pub async fn list(&self) -> Result<Vec<String>, Error> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sqlite")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_for(&self, name: &str) -> PathBuf {
        let name = name.strip_suffix(".sqlite").unwrap_or(name);
        self.dir.join(format!("{name}.sqlite"))
    }

    /// Delete database `name` and its side files. Missing files are not an error.
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        let file = self.file_for(name);
        let mut paths = vec![file.clone()];
        for suffix in SIDE_FILE_SUFFIXES {
            let mut side = file.clone().into_os_string();
            side.push(suffix);
            paths.push(PathBuf::from(side));
        }
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "removed database file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Storage(format!("{}: {e}", path.display()))),
            }
        }
        Ok(())
    }
}

type ClassFuture<'a> = Pin<Box<dyn Future<Output = (StorageClass, Result<(), Error>)> + Send + 'a>>;

/// Every local persistence layer, cleared together.
#[derive(Clone)]
pub struct CachePurge {
    local: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    databases: DatabaseDir,
    caches: CacheStorage,
}

impl fmt::Debug for CachePurge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePurge").field("databases", &self.databases).field("caches", &self.caches).finish()
    }
}

async fn clear_key_values(store: &dyn KeyValueStore, keys: Option<&[String]>) -> Result<(), Error> {
    match keys {
        Some(keys) => {
            for key in keys {
                store.remove(key).await?;
            }
            Ok(())
        }
        None => store.clear().await,
    }
}

impl CachePurge {
    pub fn new(
        local: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>, databases: DatabaseDir, caches: CacheStorage,
    ) -> Self {
        Self { local, session, databases, caches }
    }

    async fn clear_databases(&self, names: Option<&[String]>) -> Result<(), Error> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.databases.list().await?,
        };
        let results = join_all(names.iter().map(|name| self.databases.delete(name))).await;
        results.into_iter().collect::<Result<Vec<()>, Error>>()?;
        tracing::info!(count = names.len(), "deleted databases");
        Ok(())
    }

    async fn clear_caches(&self, names: Option<&[String]>) -> Result<(), Error> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.caches.namespaces().await?,
        };
        let results = join_all(names.iter().map(|name| self.caches.delete_namespace(name))).await;
        results.into_iter().collect::<Result<Vec<bool>, Error>>()?;
        tracing::info!(count = names.len(), "deleted cache namespaces");
        Ok(())
    }

    fn clear_class<'a>(&'a self, class: StorageClass, options: &'a PurgeOptions) -> ClassFuture<'a> {
        let keys = options.specific_keys.as_deref();
        Box::pin(async move {
            let result = match class {
                StorageClass::LocalStorage => clear_key_values(self.local.as_ref(), keys).await,
                StorageClass::SessionStorage => clear_key_values(self.session.as_ref(), keys).await,
                StorageClass::Databases => self.clear_databases(options.specific_databases.as_deref()).await,
                StorageClass::Caches => self.clear_caches(options.specific_caches.as_deref()).await,
            };
            (class, result.map_err(|e| Error::Storage(format!("clearing {class}: {e}"))))
        })
    }

    /// Clear every class not skipped and report per class.
    ///
    /// When `options.confirm` is set and `confirm` declines, nothing is
    /// cleared. Without a `confirm` implementation the purge proceeds.
    pub async fn run(&self, options: &PurgeOptions, confirm: Option<&dyn Confirm>) -> PurgeReport {
        if options.confirm {
            match confirm {
                Some(gate) if !gate.confirm(CONFIRM_PROMPT).await => {
                    tracing::info!("purge declined");
                    return PurgeReport::declined();
                }
                Some(_) => {}
                None => tracing::debug!("no confirmation available, purging"),
            }
        }

        let mut report = PurgeReport::default();
        let mut tasks = Vec::new();
        for class in StorageClass::ALL {
            if options.skip.contains(&class) {
                report.skipped.push(class);
            } else {
                tasks.push(self.clear_class(class, options));
            }
        }

        for (class, result) in join_all(tasks).await {
            match result {
                Ok(()) => report.cleared.push(class),
                Err(e) => {
                    tracing::error!(%class, error = %e, "purge step failed");
                    report.failed.push((class, e.to_string()));
                }
            }
        }
        tracing::info!(cleared = report.cleared.len(), failed = report.failed.len(), "purge finished");
        report
    }

    /// Like [`Self::run`], but any failed class makes the whole purge an error.
    pub async fn purge(&self, options: &PurgeOptions, confirm: Option<&dyn Confirm>) -> Result<PurgeReport, Error> {
        self.run(options, confirm).await.into_result()
    }
}
