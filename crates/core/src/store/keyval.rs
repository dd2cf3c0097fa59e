use serde_json::Value;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::RecordStore;
use crate::Error;

/// Keys holding offline submissions waiting to be synced.
pub const QUEUE_KEYS: &[&str] = &["offline_invoices", "offline_customers", "offline_payments"];

/// Default cap on the entries kept in one offline queue.
pub const MAX_QUEUE_ITEMS: usize = 1000;

/// Table a key/value pair is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTable {
    KeyVal,
    /// Offline submissions waiting to be synced.
    Queue,
    /// Bulky lookup caches.
    Cache,
}

impl KeyTable {
    /// Route a key to its table. Unlisted keys go to the general table.
    pub fn for_key(key: &str) -> Self {
        match key {
            key if QUEUE_KEYS.contains(&key) => KeyTable::Queue,
            "item_details_cache" | "customer_storage" => KeyTable::Cache,
            _ => KeyTable::KeyVal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyTable::KeyVal => "keyval",
            KeyTable::Queue => "queue",
            KeyTable::Cache => "cache",
        }
    }
}

fn check_key(key: &str) -> Result<(), Error> {
    if key.is_empty() {
        return Err(Error::InvalidInput("key must not be empty".into()));
    }
    Ok(())
}

impl RecordStore {
    /// Insert or replace `value` under `key` in the key's routed table.
    pub async fn put_value(&self, key: &str, value: &Value) -> Result<KeyTable, Error> {
        check_key(key)?;
        let table = KeyTable::for_key(key);
        let (key, json) = (key.to_string(), serde_json::to_string(value)?);
        let now = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let sql = format!(
                    "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    table.as_str()
                );
                conn.execute(&sql, params![key, json, now])
            })
            .await
            .map_err(Error::from)?;
        Ok(table)
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Value>, Error> {
        check_key(key)?;
        let table = KeyTable::for_key(key);
        let key = key.to_string();

        let json = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT value FROM {} WHERE key = ?1", table.as_str());
                conn.query_row(&sql, params![key], |row| row.get::<_, String>(0)).optional()
            })
            .await
            .map_err(Error::from)?;

        json.map(|json| serde_json::from_str(&json).map_err(Error::from)).transpose()
    }

    /// Remove `key`. Returns whether it existed.
    pub async fn delete_value(&self, key: &str) -> Result<bool, Error> {
        check_key(key)?;
        let table = KeyTable::for_key(key);
        let key = key.to_string();
        self.conn
            .call(move |conn| conn.execute(&format!("DELETE FROM {} WHERE key = ?1", table.as_str()), params![key]))
            .await
            .map(|deleted| deleted > 0)
            .map_err(Error::from)
    }

    /// Whether any offline queue holds more than `limit` entries.
    pub async fn queue_health_check(&self, limit: usize) -> Result<bool, Error> {
        for &key in QUEUE_KEYS {
            if let Some(Value::Array(entries)) = self.get_value(key).await?
                && entries.len() > limit
            {
                tracing::warn!(key, entries = entries.len(), limit, "offline queue over its limit");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop the oldest entries of every offline queue longer than `limit`.
    ///
    /// Returns how many entries were removed in total.
    pub async fn purge_old_queue_entries(&self, limit: usize) -> Result<usize, Error> {
        let mut removed = 0;
        for &key in QUEUE_KEYS {
            let Some(Value::Array(mut entries)) = self.get_value(key).await? else {
                continue;
            };
            if entries.len() <= limit {
                continue;
            }
            let excess = entries.len() - limit;
            entries.drain(..excess);
            self.put_value(key, &Value::Array(entries)).await?;
            tracing::info!(key, removed = excess, "trimmed offline queue");
            removed += excess;
        }
        Ok(removed)
    }

    /// Keys stored in `table`, sorted.
    pub async fn keys_in(&self, table: KeyTable) -> Result<Vec<String>, Error> {
        self.conn
            .call(move |conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare(&format!("SELECT key FROM {} ORDER BY key", table.as_str()))?;
                let keys = stmt.query_map([], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }
}
