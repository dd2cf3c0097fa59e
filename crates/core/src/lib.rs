//! Core types and shared functionality for posa-offline.
//!
//! This crate provides:
//! - Correlated request/response messaging with background contexts
//! - The background record store for catalog, prices, customers and queues
//! - Key/value stores and SQLite-backed response-cache storage
//! - Bulk purge of every local persistence layer
//! - Unified error types and configuration

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod kv;
pub mod migrations;
pub mod purge;
pub mod store;

pub use cache::{CacheStorage, ResponseSnapshot, ResponseType};
pub use channel::{MessageChannel, Protocol};
pub use config::AppConfig;
pub use error::Error;
pub use kv::{KeyValueStore, MemoryKv, SqliteKv};
pub use purge::{CachePurge, Confirm, PurgeOptions, PurgeReport, StorageClass};
pub use store::{RecordStore, StoreClient, StoreWorker};
