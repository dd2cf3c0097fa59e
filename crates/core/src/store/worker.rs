//! Message protocol and request handler of the record store's background context.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::customers::Customer;
use super::items::Item;
use super::{BulkWrite, MAX_QUEUE_ITEMS, RecordStore, Recovery};
use crate::Error;
use crate::channel::{Handler, Protocol};
use crate::kv::KeyValueStore;

/// Prefix of key/value mirror entries in local storage.
pub const MIRROR_PREFIX: &str = "posa_";

/// Keys too large to mirror into local storage.
pub const LARGE_KEYS: &[&str] = &["items", "item_details_cache", "local_stock_cache", "price_list_cache"];

/// Catalog fields kept when caching a raw catalog payload.
pub const CATALOG_FIELDS: &[&str] = &[
    "item_code",
    "item_name",
    "description",
    "stock_uom",
    "image",
    "item_group",
    "rate",
    "price_list_rate",
    "currency",
    "item_barcode",
    "item_uoms",
    "actual_qty",
    "has_batch_no",
    "has_serial_no",
    "serial_no_data",
    "batch_no_data",
];

/// Requests understood by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StoreRequest {
    /// Handshake; answered with the schema version.
    Init,
    /// Upsert one key/value pair.
    Persist { key: String, value: Value },
    /// Upsert raw catalog items.
    BulkPutItems { items: Vec<Value> },
    /// Derive and upsert one price record per item for `price_list`.
    BulkPutPrices { price_list: String, items: Vec<Value> },
    /// Upsert raw customer records.
    BulkPutCustomers { customers: Vec<Value> },
    /// Parse a raw catalog payload, trim it, store items and optional prices.
    ParseAndCache {
        json: String,
        #[serde(default)]
        price_list: Option<String>,
    },
    /// Drop the oldest entries of offline queues longer than `limit`.
    TrimQueues {
        #[serde(default)]
        limit: Option<usize>,
    },
    Cleanup,
}

impl StoreRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreRequest::Init => "init",
            StoreRequest::Persist { .. } => "persist",
            StoreRequest::BulkPutItems { .. } => "bulk_put_items",
            StoreRequest::BulkPutPrices { .. } => "bulk_put_prices",
            StoreRequest::BulkPutCustomers { .. } => "bulk_put_customers",
            StoreRequest::ParseAndCache { .. } => "parse_and_cache",
            StoreRequest::TrimQueues { .. } => "trim_queues",
            StoreRequest::Cleanup => "cleanup",
        }
    }
}

/// Success replies of the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StoreResponse {
    Ready { schema_version: i64, healthy: bool },
    Persisted { key: String, table: String, mirrored: bool },
    ItemsSaved(BulkWrite),
    PricesSaved(BulkWrite),
    CustomersSaved(BulkWrite),
    Parsed { items: Vec<Item> },
    QueuesTrimmed { removed: usize },
    CleanedUp,
}

/// Message shapes of the record store channel.
#[derive(Debug)]
pub struct StoreProtocol;

impl Protocol for StoreProtocol {
    type Request = StoreRequest;
    type Response = StoreResponse;

    fn init() -> Option<StoreRequest> {
        Some(StoreRequest::Init)
    }

    fn cleanup() -> Option<StoreRequest> {
        Some(StoreRequest::Cleanup)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Unwrap a catalog payload: either a list or an object whose `message` is the list.
fn catalog_rows(json: &str) -> Result<Vec<Value>, Error> {
    let parsed: Value = serde_json::from_str(json)?;
    let list = match parsed {
        Value::Object(mut map) => match map.remove("message") {
            Some(message) if truthy(&message) => message,
            _ => Value::Object(map),
        },
        other => other,
    };
    match list {
        Value::Array(rows) => Ok(rows),
        _ => Err(Error::InvalidInput("catalog payload is not a list of items".into())),
    }
}

/// Keep only [`CATALOG_FIELDS`]; `has_variants` is always present as a boolean.
fn trim_catalog_row(row: Value) -> Value {
    let Value::Object(mut source) = row else {
        return row;
    };
    let mut trimmed = Map::new();
    for field in CATALOG_FIELDS {
        if let Some(value) = source.remove(*field) {
            trimmed.insert((*field).to_string(), value);
        }
    }
    let has_variants = source.get("has_variants").is_some_and(truthy);
    trimmed.insert("has_variants".into(), Value::Bool(has_variants));
    Value::Object(trimmed)
}

/// Record store request handler.
///
/// Every successful key/value write is also mirrored under
/// [`MIRROR_PREFIX`] into local storage, unless the key is in
/// [`LARGE_KEYS`] or the serialized value exceeds the size limit.
pub struct StoreWorker {
    store: RecordStore,
    mirror: Option<Arc<dyn KeyValueStore>>,
    mirror_max_bytes: usize,
}

impl std::fmt::Debug for StoreWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWorker")
            .field("store", &self.store)
            .field("mirror", &self.mirror.is_some())
            .field("mirror_max_bytes", &self.mirror_max_bytes)
            .finish()
    }
}

impl StoreWorker {
    pub fn new(store: RecordStore) -> Self {
        Self { store, mirror: None, mirror_max_bytes: 0 }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn KeyValueStore>, max_bytes: usize) -> Self {
        self.mirror = Some(mirror);
        self.mirror_max_bytes = max_bytes;
        self
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    async fn mirror(&self, key: &str, value: &Value) -> bool {
        let Some(mirror) = &self.mirror else {
            return false;
        };
        if LARGE_KEYS.contains(&key) {
            return false;
        }
        let serialized = value.to_string();
        if serialized.len() > self.mirror_max_bytes {
            tracing::debug!(key, bytes = serialized.len(), "value too large to mirror");
            return false;
        }
        match mirror.set(&format!("{MIRROR_PREFIX}{key}"), &serialized).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, error = %e, "mirror write failed");
                false
            }
        }
    }

    /// Run the health check, repairing the store when it fails.
    async fn recover(&mut self) -> bool {
        match self.store.ensure_healthy().await {
            Ok(Recovery::Healthy) => true,
            Ok(recovery) => {
                tracing::warn!(?recovery, "record store was repaired");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "record store is unhealthy");
                false
            }
        }
    }

    async fn persist(&self, key: String, value: Value) -> Result<StoreResponse, Error> {
        let table = self.store.put_value(&key, &value).await?;
        let mirrored = self.mirror(&key, &value).await;
        Ok(StoreResponse::Persisted { key, table: table.as_str().to_string(), mirrored })
    }

    async fn parse_and_cache(&self, json: String, price_list: Option<String>) -> Result<StoreResponse, Error> {
        let rows = catalog_rows(&json)?;
        drop(json);
        let items = Item::from_raw_batch(rows.into_iter().map(trim_catalog_row).collect())?;

        let saved = self.store.bulk_upsert_items(items.clone()).await?;
        if let Some(price_list) = price_list.as_deref() {
            self.store.bulk_upsert_prices(price_list, &items).await?;
        }
        tracing::info!(items = saved.records, transactions = saved.transactions, "catalog cached");
        Ok(StoreResponse::Parsed { items })
    }

    async fn run(&mut self, request: StoreRequest) -> Result<StoreResponse, Error> {
        match request {
            StoreRequest::Init => {
                let healthy = self.recover().await;
                Ok(StoreResponse::Ready { schema_version: self.store.schema_version(), healthy })
            }
            StoreRequest::Persist { key, value } => {
                self.recover().await;
                self.persist(key, value).await
            }
            StoreRequest::BulkPutItems { items } => {
                let items = Item::from_raw_batch(items)?;
                Ok(StoreResponse::ItemsSaved(self.store.bulk_upsert_items(items).await?))
            }
            StoreRequest::BulkPutPrices { price_list, items } => {
                let items = Item::from_raw_batch(items)?;
                Ok(StoreResponse::PricesSaved(self.store.bulk_upsert_prices(&price_list, &items).await?))
            }
            StoreRequest::BulkPutCustomers { customers } => {
                let customers = Customer::from_raw_batch(customers)?;
                Ok(StoreResponse::CustomersSaved(self.store.bulk_upsert_customers(customers).await?))
            }
            StoreRequest::ParseAndCache { json, price_list } => self.parse_and_cache(json, price_list).await,
            StoreRequest::TrimQueues { limit } => {
                let removed = self.store.purge_old_queue_entries(limit.unwrap_or(MAX_QUEUE_ITEMS)).await?;
                Ok(StoreResponse::QueuesTrimmed { removed })
            }
            StoreRequest::Cleanup => {
                tracing::info!("record store cleaning up");
                Ok(StoreResponse::CleanedUp)
            }
        }
    }
}

#[async_trait]
impl Handler for StoreWorker {
    type Protocol = StoreProtocol;

    async fn handle(&mut self, request: StoreRequest) -> Result<StoreResponse, Error> {
        let kind = request.kind();
        let result = self.run(request).await;
        if let Err(e) = &result {
            tracing::error!(request = kind, error = %e, "record store request failed");
        }
        result
    }
}
