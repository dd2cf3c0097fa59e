//! Flat string key/value stores.
//!
//! Local storage is persisted in SQLite and survives restarts. Session storage
//! lives in memory for the lifetime of the process.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_rusqlite::rusqlite::OptionalExtension;
use tokio_rusqlite::{Connection, params};

use crate::Error;

/// String key/value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;
    async fn remove(&self, key: &str) -> Result<(), Error>;
    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>, Error>;
    async fn clear(&self) -> Result<(), Error>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.entries.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), Error> {
        self.entries.write().await.clear();
        Ok(())
    }
}

/// SQLite-backed store.
#[derive(Clone, Debug)]
pub struct SqliteKv {
    conn: Connection,
}

impl SqliteKv {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path).await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory().await.map_err(|e| Error::Database(e.into()))?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, Error> {
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 CREATE TABLE IF NOT EXISTS entries (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );",
            )
        })
        .await
        .map_err(Error::Database)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row("SELECT value FROM entries WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()
            })
            .await
            .map_err(Error::from)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO entries (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![key, value],
                )
                .map(|_| ())
            })
            .await
            .map_err(Error::from)
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| conn.execute("DELETE FROM entries WHERE key = ?1", params![key]).map(|_| ()))
            .await
            .map_err(Error::from)
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT key FROM entries ORDER BY key")?;
                let keys = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }

    async fn clear(&self) -> Result<(), Error> {
        self.conn
            .call(|conn| conn.execute("DELETE FROM entries", []).map(|_| ()))
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyValueStore) {
        store.set("posa_b", "2").await.unwrap();
        store.set("posa_a", "1").await.unwrap();
        store.set("posa_a", "one").await.unwrap();

        assert_eq!(store.get("posa_a").await.unwrap().as_deref(), Some("one"));
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.keys().await.unwrap(), vec!["posa_a", "posa_b"]);

        store.remove("posa_a").await.unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["posa_b"]);

        store.clear().await.unwrap();
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_kv() {
        exercise(&MemoryKv::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_kv() {
        exercise(&SqliteKv::open_in_memory().await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_sqlite_kv_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local_storage.sqlite");

        SqliteKv::open(&path).await.unwrap().set("posa_k", "v").await.unwrap();
        let reopened = SqliteKv::open(&path).await.unwrap();
        assert_eq!(reopened.get("posa_k").await.unwrap().as_deref(), Some("v"));
    }
}
