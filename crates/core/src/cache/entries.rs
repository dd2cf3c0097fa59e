//! Cached response CRUD operations.
//!
//! Entries are keyed by request URL within a namespace. Re-putting a URL
//! replaces its entry and moves it to the end of the namespace's order.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row};

use super::connection::CacheStorage;
use super::hash::{request_key, without_search};
use crate::Error;

/// How a response was obtained, as seen by the page that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    Basic,
    /// Cross-origin response readable under CORS.
    Cors,
    /// Response not attributable to a request mode.
    Default,
    /// Cross-origin response without CORS; its body is not readable.
    Opaque,
    /// Network error placeholder.
    Error,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Default => "default",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(ResponseType::Basic),
            "cors" => Some(ResponseType::Cors),
            "default" => Some(ResponseType::Default),
            "opaque" => Some(ResponseType::Opaque),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// A complete HTTP response held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub url: String,
    pub status: u16,
    pub response_type: ResponseType,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ResponseSnapshot {
    pub fn new(url: impl Into<String>, status: u16, response_type: ResponseType, body: impl Into<Bytes>) -> Self {
        Self { url: url.into(), status, response_type, headers: Vec::new(), body: body.into() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Status in the 2xx range.
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Status exactly 200 and a readable response type.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200
            && matches!(self.response_type, ResponseType::Basic | ResponseType::Default | ResponseType::Cors)
    }
}

fn read_snapshot(row: &Row<'_>) -> rusqlite::Result<ResponseSnapshot> {
    let response_type: String = row.get(2)?;
    let headers: String = row.get(3)?;
    let body: Vec<u8> = row.get(4)?;
    Ok(ResponseSnapshot {
        url: row.get(0)?,
        status: row.get(1)?,
        response_type: ResponseType::parse(&response_type).unwrap_or(ResponseType::Default),
        headers: serde_json::from_str(&headers).unwrap_or_default(),
        body: Bytes::from(body),
    })
}

const SNAPSHOT_COLUMNS: &str = "e.url, e.status, e.response_type, e.headers_json, e.body";

impl CacheStorage {
    /// Store `response` for `url` in `namespace`, creating the namespace if needed.
    pub async fn put(&self, namespace: &str, url: &str, response: &ResponseSnapshot) -> Result<(), Error> {
        let namespace = namespace.to_string();
        let url = url.to_string();
        let response = response.clone();
        let headers = serde_json::to_string(&response.headers)?;
        let now = chrono::Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| -> Result<(), Error> {
                let key = request_key("GET", &url);
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO cache_namespaces (name, created_seq, created_at)
                     VALUES (?1, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM cache_namespaces), ?2)",
                    params![namespace, now],
                )?;
                tx.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1 AND key_hash = ?2",
                    params![namespace, key],
                )?;
                tx.execute(
                    "INSERT INTO cache_entries (
                        namespace, key_hash, url, search_free_url, status, response_type,
                        headers_json, body, stored_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        namespace,
                        key,
                        url,
                        without_search(&url),
                        response.status,
                        response.response_type.as_str(),
                        headers,
                        response.body.as_ref(),
                        now,
                    ],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Look `url` up in one namespace.
    ///
    /// With `ignore_search`, the query string is ignored on both sides and the
    /// oldest matching entry wins.
    pub async fn match_in(
        &self, namespace: &str, url: &str, ignore_search: bool,
    ) -> Result<Option<ResponseSnapshot>, Error> {
        let namespace = namespace.to_string();
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ResponseSnapshot>, Error> {
                let found = if ignore_search {
                    let sql = format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM cache_entries e
                         WHERE e.namespace = ?1 AND e.search_free_url = ?2 ORDER BY e.seq LIMIT 1"
                    );
                    conn.query_row(&sql, params![namespace, without_search(&url)], read_snapshot).optional()?
                } else {
                    let sql = format!(
                        "SELECT {SNAPSHOT_COLUMNS} FROM cache_entries e
                         WHERE e.namespace = ?1 AND e.key_hash = ?2"
                    );
                    conn.query_row(&sql, params![namespace, request_key("GET", &url)], read_snapshot).optional()?
                };
                Ok(found)
            })
            .await
            .map_err(Error::from)
    }

    /// Look `url` up across every namespace, oldest namespace first.
    pub async fn match_any(&self, url: &str, ignore_search: bool) -> Result<Option<ResponseSnapshot>, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ResponseSnapshot>, Error> {
                let (filter, needle) = if ignore_search {
                    ("e.search_free_url = ?1", without_search(&url).to_string())
                } else {
                    ("e.key_hash = ?1", request_key("GET", &url))
                };
                let sql = format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM cache_entries e
                     JOIN cache_namespaces n ON n.name = e.namespace
                     WHERE {filter}
                     ORDER BY n.created_seq, e.seq LIMIT 1"
                );
                Ok(conn.query_row(&sql, params![needle], read_snapshot).optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// URLs stored in `namespace`, oldest first.
    pub async fn keys(&self, namespace: &str) -> Result<Vec<String>, Error> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT url FROM cache_entries WHERE namespace = ?1 ORDER BY seq")?;
                let urls = stmt.query_map(params![namespace], |row| row.get(0))?.collect::<Result<Vec<String>, _>>()?;
                Ok(urls)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn entry_count(&self, namespace: &str) -> Result<u64, Error> {
        let namespace = namespace.to_string();
        self.conn
            .call(move |conn| {
                conn.query_row("SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1", params![namespace], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .await
            .map(|count| count as u64)
            .map_err(Error::from)
    }

    /// Remove the entry for `url`. Returns whether it existed.
    pub async fn delete_entry(&self, namespace: &str, url: &str) -> Result<bool, Error> {
        let namespace = namespace.to_string();
        let key = request_key("GET", url);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1 AND key_hash = ?2",
                    params![namespace, key],
                )
            })
            .await
            .map(|deleted| deleted > 0)
            .map_err(Error::from)
    }

    /// Delete the oldest entries of `namespace` until at most `max_entries` remain.
    ///
    /// Returns the number of deleted entries.
    pub async fn enforce_limit(&self, namespace: &str, max_entries: usize) -> Result<u64, Error> {
        let namespace = namespace.to_string();
        let max = max_entries as i64;
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
                    params![namespace],
                    |row| row.get(0),
                )?;
                if count <= max {
                    return Ok(0);
                }

                let to_delete = count - max;
                let deleted = conn.execute(
                    "DELETE FROM cache_entries WHERE seq IN (
                        SELECT seq FROM cache_entries WHERE namespace = ?1 ORDER BY seq ASC LIMIT ?2
                    )",
                    params![namespace, to_delete],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "posawesome-cache-1700000000";

    fn page(url: &str, body: &str) -> ResponseSnapshot {
        ResponseSnapshot::new(url, 200, ResponseType::Basic, body.to_string()).with_header("Content-Type", "text/html")
    }

    #[test]
    fn test_cacheable() {
        assert!(page("https://pos.local/", "").is_cacheable());
        assert!(ResponseSnapshot::new("u", 200, ResponseType::Cors, "").is_cacheable());
        assert!(!ResponseSnapshot::new("u", 200, ResponseType::Opaque, "").is_cacheable());
        assert!(!ResponseSnapshot::new("u", 206, ResponseType::Basic, "").is_cacheable());
        assert!(ResponseSnapshot::new("u", 204, ResponseType::Basic, "").is_ok());
    }

    #[test]
    fn test_header_lookup() {
        assert_eq!(page("u", "").header("content-type"), Some("text/html"));
        assert_eq!(page("u", "").header("etag"), None);
    }

    #[tokio::test]
    async fn test_put_and_match() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        let url = "https://pos.local/assets/posawesome/dist/js/posawesome.umd.js";
        storage.put(NS, url, &page(url, "bundle")).await.unwrap();

        let found = storage.match_in(NS, url, false).await.unwrap().unwrap();
        assert_eq!(found.body, Bytes::from("bundle"));
        assert_eq!(found.header("Content-Type"), Some("text/html"));
        assert!(storage.has_namespace(NS).await.unwrap());
        assert!(storage.match_in(NS, "https://pos.local/other.js", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_match_ignoring_search() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        storage.put(NS, "https://pos.local/app/posapp", &page("https://pos.local/app/posapp", "shell")).await.unwrap();

        let query = "https://pos.local/app/posapp?pos_profile=Main";
        assert!(storage.match_in(NS, query, false).await.unwrap().is_none());
        let found = storage.match_in(NS, query, true).await.unwrap().unwrap();
        assert_eq!(found.body, Bytes::from("shell"));
    }

    #[tokio::test]
    async fn test_match_any_prefers_oldest_namespace() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        let url = "https://pos.local/offline.html";
        storage.put("older", url, &page(url, "old")).await.unwrap();
        storage.put("newer", url, &page(url, "new")).await.unwrap();

        let found = storage.match_any(url, false).await.unwrap().unwrap();
        assert_eq!(found.body, Bytes::from("old"));
        assert!(storage.match_any("https://pos.local/missing", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_and_moves_to_end() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        for name in ["a", "b", "a"] {
            let url = format!("https://pos.local/{name}.js");
            storage.put(NS, &url, &page(&url, name)).await.unwrap();
        }
        assert_eq!(storage.keys(NS).await.unwrap(), vec!["https://pos.local/b.js", "https://pos.local/a.js"]);
    }

    #[tokio::test]
    async fn test_enforce_limit_evicts_oldest() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        let (limit, extra) = (5, 3);
        for i in 0..limit + extra {
            let url = format!("https://pos.local/assets/{i}.js");
            storage.put(NS, &url, &page(&url, "x")).await.unwrap();
        }

        let deleted = storage.enforce_limit(NS, limit).await.unwrap();
        assert_eq!(deleted, extra as u64);
        assert_eq!(storage.entry_count(NS).await.unwrap(), limit as u64);

        let keys = storage.keys(NS).await.unwrap();
        assert_eq!(keys.first().map(String::as_str), Some("https://pos.local/assets/3.js"));
        assert_eq!(storage.enforce_limit(NS, limit).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_entry_and_namespace() {
        let storage = CacheStorage::open_in_memory().await.unwrap();
        let url = "https://pos.local/manifest.json";
        storage.put(NS, url, &page(url, "{}")).await.unwrap();

        assert!(storage.delete_entry(NS, url).await.unwrap());
        assert!(!storage.delete_entry(NS, url).await.unwrap());

        storage.put(NS, url, &page(url, "{}")).await.unwrap();
        assert!(storage.delete_namespace(NS).await.unwrap());
        assert!(storage.match_any(url, false).await.unwrap().is_none());
    }
}
