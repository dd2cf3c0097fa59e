//! Background record store.
//!
//! A versioned SQLite database holding key/value tables, catalog items,
//! per-price-list prices, and customers. Bulk writes are split into chunks
//! and each chunk commits in its own transaction, so the store stays
//! responsive to other requests between chunks.
//!
//! The store is normally owned by a [`StoreWorker`] running in a background
//! context and reached through a [`StoreClient`].

mod client;
mod customers;
mod derive;
mod items;
mod keyval;
mod persist_queue;
mod prices;
mod worker;

use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{ErrorCode, Transaction};

use crate::Error;
use crate::migrations::{self, Migration, Step};

pub use client::StoreClient;
pub use customers::Customer;
pub use derive::{DerivedFields, TokenKind};
pub use items::Item;
pub use keyval::{KeyTable, MAX_QUEUE_ITEMS, QUEUE_KEYS};
pub use persist_queue::{PERSIST_DELAY, PersistQueue};
pub use prices::PriceRecord;
pub use worker::{
    CATALOG_FIELDS, LARGE_KEYS, MIRROR_PREFIX, StoreProtocol, StoreRequest, StoreResponse, StoreWorker,
};

/// Database name under the data directory's `databases/` folder.
pub const DATABASE_NAME: &str = "posawesome_offline";

/// Records written per transaction.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

pub(crate) static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "key/value tables",
        step: Step::Sql(include_str!("../../migrations/records/001_keyval.sql")),
    },
    Migration {
        version: 2,
        description: "items, prices and customers",
        step: Step::Sql(include_str!("../../migrations/records/002_records.sql")),
    },
    Migration {
        version: 3,
        description: "item lookup tokens",
        step: Step::Sql(include_str!("../../migrations/records/003_item_tokens.sql")),
    },
    Migration { version: 4, description: "derive item lookup lists", step: Step::Data(items::rederive_step) },
];

/// Outcome of a chunked bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BulkWrite {
    /// Records written.
    pub records: usize,
    /// Transactions committed.
    pub transactions: usize,
}

/// What [`RecordStore::ensure_healthy`] had to do to get a working connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Healthy,
    /// A fresh connection to the same file passed the check.
    Reopened,
    /// The file was corrupt and has been replaced by an empty store.
    Recreated,
}

fn is_corruption(err: &Error) -> bool {
    let Error::Database(tokio_rusqlite::Error::Error(e)) = err else {
        return false;
    };
    matches!(e.sqlite_error_code(), Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase))
}

/// Remove a database file together with its WAL and shared-memory files.
async fn remove_database_files(path: &Path) -> Result<(), Error> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    for file in files {
        match tokio::fs::remove_file(&file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Record store handle.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread.
#[derive(Clone, Debug)]
pub struct RecordStore {
    pub(crate) conn: Connection,
    path: Option<PathBuf>,
    chunk_size: usize,
    schema_version: i64,
}

impl RecordStore {
    /// Open the store at `path`, creating it and applying pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, Some(path)).await
    }

    /// Open an in-memory store for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn, None).await
    }

    /// Open the store at `path`, replacing the file with an empty store when it is corrupt.
    pub async fn open_or_recreate(path: impl AsRef<Path>) -> Result<(Self, Recovery), Error> {
        let path = path.as_ref();
        match Self::open(path).await {
            Ok(mut store) => {
                let recovery = store.ensure_healthy().await?;
                Ok((store, recovery))
            }
            Err(e) if is_corruption(&e) => {
                tracing::warn!(path = %path.display(), error = %e, "record store is corrupt, recreating");
                remove_database_files(path).await?;
                Ok((Self::open(path).await?, Recovery::Recreated))
            }
            Err(e) => Err(e),
        }
    }

    async fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA temp_store=MEMORY;
                 PRAGMA foreign_keys=ON;",
            )
        })
        .await
        .map_err(Error::Database)?;

        let schema_version = migrations::run(&conn, MIGRATIONS).await?;
        Ok(Self { conn, path, chunk_size: DEFAULT_CHUNK_SIZE, schema_version })
    }

    /// Override the number of records per transaction. Zero is treated as one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Schema version the store was brought up to when opened.
    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    /// Whether the store answers a trivial read.
    pub async fn check_health(&self) -> bool {
        match self.health_read().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "record store health check failed");
                false
            }
        }
    }

    async fn health_read(&self) -> Result<(), Error> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM keyval WHERE key = 'health_check'", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Check the connection and repair it when the check fails.
    ///
    /// An unhealthy store is first reopened from the same file. Only when the
    /// reopened file turns out to be corrupt is it deleted and recreated
    /// empty. Any other failure is returned and the file is left alone.
    pub async fn ensure_healthy(&mut self) -> Result<Recovery, Error> {
        if self.check_health().await {
            return Ok(Recovery::Healthy);
        }
        let Some(path) = self.path.clone() else {
            return Err(Error::Storage("in-memory record store failed its health check".into()));
        };
        let chunk_size = self.chunk_size;

        tracing::info!(path = %path.display(), "reopening record store");
        let reopened = match Self::open(&path).await {
            Ok(store) => store.health_read().await.map(|()| store),
            Err(e) => Err(e),
        };
        let (store, recovery) = match reopened {
            Ok(store) => (store, Recovery::Reopened),
            Err(e) if is_corruption(&e) => {
                tracing::warn!(path = %path.display(), error = %e, "record store is corrupt, recreating");
                remove_database_files(&path).await?;
                (Self::open(&path).await?, Recovery::Recreated)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to reopen record store");
                return Err(e);
            }
        };

        *self = store.with_chunk_size(chunk_size);
        tracing::info!(?recovery, "record store recovered");
        Ok(recovery)
    }

    /// Write `records` in chunks of [`Self::chunk_size`], one transaction per chunk.
    ///
    /// A failed chunk stops the write; chunks before it stay committed.
    async fn write_chunked<T: Send + 'static>(
        &self, table: &'static str, records: Vec<T>,
        write: fn(&Transaction<'_>, &T, &str) -> Result<(), Error>,
    ) -> Result<BulkWrite, Error> {
        let total = records.len().div_ceil(self.chunk_size);
        let mut outcome = BulkWrite::default();
        let mut remaining = records.into_iter();

        for chunk in 1..=total {
            let batch: Vec<T> = remaining.by_ref().take(self.chunk_size).collect();
            let len = batch.len();
            let now = chrono::Utc::now().to_rfc3339();

            self.conn
                .call(move |conn| -> Result<(), Error> {
                    let tx = conn.transaction()?;
                    for record in &batch {
                        write(&tx, record, &now)?;
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await
                .map_err(Error::from)
                .map_err(|e| {
                    tracing::error!(table, chunk, total, error = %e, "bulk write chunk failed");
                    Error::ChunkFailed { chunk, total, reason: e.to_string() }
                })?;

            outcome.records += len;
            outcome.transactions += 1;
            tracing::debug!(table, chunk, total, records = len, "committed chunk");
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let store = RecordStore::open_in_memory().await.unwrap();
        assert_eq!(store.schema_version(), migrations::target_version(MIGRATIONS));
        assert_eq!(store.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert!(store.check_health().await);
    }

    #[tokio::test]
    async fn test_reopen_keeps_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posawesome_offline.sqlite");

        let first = RecordStore::open(&path).await.unwrap();
        let version = first.schema_version();
        drop(first);

        let second = RecordStore::open(&path).await.unwrap();
        assert_eq!(second.schema_version(), version);
        assert_eq!(migrations::current_version(&second.conn).await.unwrap(), version);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_is_clamped() {
        let store = RecordStore::open_in_memory().await.unwrap().with_chunk_size(0);
        assert_eq!(store.chunk_size(), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_earlier_chunks() {
        let store = RecordStore::open_in_memory().await.unwrap().with_chunk_size(2);
        store
            .conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_bad BEFORE INSERT ON items WHEN NEW.item_code = 'BAD'
                     BEGIN SELECT RAISE(ABORT, 'rejected item'); END;",
                )
            })
            .await
            .unwrap();

        let items = ["A", "B", "C", "BAD", "E", "F"]
            .into_iter()
            .map(|code| Item::from_raw(serde_json::json!({"item_code": code})).unwrap())
            .collect();
        let err = store.bulk_upsert_items(items).await.unwrap_err();

        assert_eq!(err.code(), "STORAGE_ERROR");
        assert!(matches!(err, Error::ChunkFailed { chunk: 2, total: 3, .. }));
        assert!(err.to_string().contains("rejected item"));
        assert_eq!(store.item_count().await.unwrap(), 2);
        assert!(store.get_item("B").await.unwrap().is_some());
        assert!(store.get_item("C").await.unwrap().is_none());
        assert!(store.get_item("E").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_healthy_store_needs_no_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let (mut store, recovery) =
            RecordStore::open_or_recreate(dir.path().join("posawesome_offline.sqlite")).await.unwrap();
        assert_eq!(recovery, Recovery::Healthy);
        assert_eq!(store.ensure_healthy().await.unwrap(), Recovery::Healthy);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posawesome_offline.sqlite");
        std::fs::write(&path, vec![0x5a; 8192]).unwrap();

        let err = RecordStore::open(&path).await.unwrap_err();
        assert!(is_corruption(&err));

        let (store, recovery) = RecordStore::open_or_recreate(&path).await.unwrap();
        assert_eq!(recovery, Recovery::Recreated);
        assert!(store.check_health().await);
        assert_eq!(store.schema_version(), migrations::target_version(MIGRATIONS));
    }

    #[tokio::test]
    async fn test_unhealthy_store_is_not_deleted_without_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("posawesome_offline.sqlite");
        let mut store = RecordStore::open(&path).await.unwrap().with_chunk_size(5);
        store.put_value("offline_invoices", &serde_json::json!(["INV-1"])).await.unwrap();
        store.conn.call(|conn| conn.execute_batch("DROP TABLE keyval")).await.unwrap();

        assert!(!store.check_health().await);
        assert!(store.ensure_healthy().await.is_err());
        assert!(path.exists());
        assert_eq!(store.get_value("offline_invoices").await.unwrap(), Some(serde_json::json!(["INV-1"])));
    }

    #[tokio::test]
    async fn test_in_memory_store_cannot_recover() {
        let mut store = RecordStore::open_in_memory().await.unwrap();
        store.conn.call(|conn| conn.execute_batch("DROP TABLE keyval")).await.unwrap();
        let err = store.ensure_healthy().await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_ERROR");
    }
}
