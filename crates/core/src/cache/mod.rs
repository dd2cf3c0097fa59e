//! SQLite-backed storage of named HTTP response caches.
//!
//! Each namespace is an ordered set of request URL to response entries. It
//! supports:
//!
//! - Exact and query-insensitive lookups, within one namespace or across all
//! - Insertion-ordered eviction down to an entry cap
//! - WAL mode for concurrent access

pub mod connection;
pub mod entries;
pub mod hash;

pub use connection::CacheStorage;
pub use entries::{ResponseSnapshot, ResponseType};
