//! Database connection management with pragma configuration.
//!
//! This module handles opening the response-cache database, applying
//! pragmas (WAL mode), running migrations, and managing named namespaces.

use std::path::Path;

use tokio_rusqlite::{Connection, params};

use crate::Error;
use crate::migrations::{self, Migration, Step};

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "response cache namespaces",
    step: Step::Sql(include_str!("../../migrations/cache_storage/001_namespaces.sql")),
}];

/// Persistent storage of named response caches.
///
/// Wraps a tokio-rusqlite Connection that runs database operations
/// on a background thread.
#[derive(Clone, Debug)]
pub struct CacheStorage {
    pub(crate) conn: Connection,
}

impl CacheStorage {
    /// Open the storage at `path`, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    /// Open an in-memory storage for testing.
    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
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

        migrations::run(&conn, MIGRATIONS).await?;
        Ok(Self { conn })
    }

    /// Create namespace `name` if it does not exist.
    pub async fn open_namespace(&self, name: &str) -> Result<(), Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO cache_namespaces (name, created_seq, created_at)
                     VALUES (?1, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM cache_namespaces), ?2)",
                    params![name, chrono::Utc::now().to_rfc3339()],
                )
                .map(|_| ())
            })
            .await
            .map_err(Error::from)
    }

    pub async fn has_namespace(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM cache_namespaces WHERE name = ?1)",
                    params![name],
                    |row| row.get(0),
                )
            })
            .await
            .map_err(Error::from)
    }

    /// Namespace names in creation order.
    pub async fn namespaces(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT name FROM cache_namespaces ORDER BY created_seq")?;
                let names = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete namespace `name` and its entries. Returns whether it existed.
    pub async fn delete_namespace(&self, name: &str) -> Result<bool, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM cache_entries WHERE namespace = ?1", params![name])?;
                let deleted = tx.execute("DELETE FROM cache_namespaces WHERE name = ?1", params![name])?;
                tx.commit()?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        assert!(storage.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        storage.open_namespace("posawesome-cache-1").await.unwrap();
        storage.open_namespace("posawesome-cache-2").await.unwrap();
        storage.open_namespace("posawesome-cache-1").await.unwrap();

        assert_eq!(storage.namespaces().await.unwrap(), vec!["posawesome-cache-1", "posawesome-cache-2"]);
        assert!(storage.has_namespace("posawesome-cache-2").await.unwrap());

        assert!(storage.delete_namespace("posawesome-cache-1").await.unwrap());
        assert!(!storage.delete_namespace("posawesome-cache-1").await.unwrap());
        assert_eq!(storage.namespaces().await.unwrap(), vec!["posawesome-cache-2"]);
    }
}
