use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, Transaction};

use super::items::Item;
use super::{BulkWrite, RecordStore};
use crate::Error;

/// Price of one item on one price list, keyed by `(price_list, item_code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PriceRecord {
    pub price_list: String,
    pub item_code: String,
    pub rate: f64,
    pub price_list_rate: f64,
    /// Milliseconds since the Unix epoch when the record was derived.
    pub timestamp: i64,
}

/// First present numeric price among `price_list_rate` then `rate`, else zero.
///
/// An explicit zero counts as present.
fn effective_price(attributes: &Map<String, Value>) -> f64 {
    ["price_list_rate", "rate"]
        .iter()
        .find_map(|field| match attributes.get(*field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .unwrap_or(0.0)
}

impl PriceRecord {
    pub fn derive(price_list: &str, item: &Item, timestamp: i64) -> Self {
        let price = effective_price(&item.attributes);
        Self {
            price_list: price_list.to_string(),
            item_code: item.item_code.clone(),
            rate: price,
            price_list_rate: price,
            timestamp,
        }
    }
}

fn write_price(tx: &Transaction<'_>, price: &PriceRecord, _now: &str) -> Result<(), Error> {
    tx.execute(
        "INSERT INTO item_prices (price_list, item_code, rate, price_list_rate, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(price_list, item_code) DO UPDATE SET
            rate = excluded.rate,
            price_list_rate = excluded.price_list_rate,
            timestamp = excluded.timestamp",
        params![&price.price_list, &price.item_code, price.rate, price.price_list_rate, price.timestamp],
    )?;
    Ok(())
}

fn read_price(row: &Row<'_>) -> rusqlite::Result<PriceRecord> {
    Ok(PriceRecord {
        price_list: row.get(0)?,
        item_code: row.get(1)?,
        rate: row.get(2)?,
        price_list_rate: row.get(3)?,
        timestamp: row.get(4)?,
    })
}

impl RecordStore {
    /// Derive one price record per item for `price_list` and upsert them.
    ///
    /// An empty price list name writes nothing.
    pub async fn bulk_upsert_prices(&self, price_list: &str, items: &[Item]) -> Result<BulkWrite, Error> {
        if price_list.is_empty() {
            tracing::debug!("no price list given, skipping price records");
            return Ok(BulkWrite::default());
        }
        let now = chrono::Utc::now().timestamp_millis();
        let records = items.iter().map(|item| PriceRecord::derive(price_list, item, now)).collect();
        self.write_chunked("item_prices", records, write_price).await
    }

    pub async fn get_price(&self, price_list: &str, item_code: &str) -> Result<Option<PriceRecord>, Error> {
        let (price_list, item_code) = (price_list.to_string(), item_code.to_string());
        self.conn
            .call(move |conn| -> Result<Option<PriceRecord>, Error> {
                Ok(conn
                    .query_row(
                        "SELECT price_list, item_code, rate, price_list_rate, timestamp
                         FROM item_prices WHERE price_list = ?1 AND item_code = ?2",
                        params![price_list, item_code],
                        read_price,
                    )
                    .optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Prices of one item across every price list.
    pub async fn prices_for_item(&self, item_code: &str) -> Result<Vec<PriceRecord>, Error> {
        let item_code = item_code.to_string();
        self.conn
            .call(move |conn| -> Result<Vec<PriceRecord>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT price_list, item_code, rate, price_list_rate, timestamp
                     FROM item_prices WHERE item_code = ?1 ORDER BY price_list",
                )?;
                let prices = stmt.query_map(params![item_code], read_price)?.collect::<Result<Vec<_>, _>>()?;
                Ok(prices)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn price_count(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM item_prices", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|count| count as u64)
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(raw: Value) -> Item {
        Item::from_raw(raw).unwrap()
    }

    #[test]
    fn test_price_fallback_order() {
        let now = 1_700_000_000_000;
        let both = item(json!({"item_code": "A", "price_list_rate": 12.5, "rate": 10}));
        assert_eq!(PriceRecord::derive("Retail", &both, now).rate, 12.5);

        let rate_only = item(json!({"item_code": "B", "rate": 10}));
        assert_eq!(PriceRecord::derive("Retail", &rate_only, now).price_list_rate, 10.0);

        let null_first = item(json!({"item_code": "C", "price_list_rate": null, "rate": 7}));
        assert_eq!(PriceRecord::derive("Retail", &null_first, now).rate, 7.0);

        let zero = item(json!({"item_code": "D", "price_list_rate": 0, "rate": 9}));
        assert_eq!(PriceRecord::derive("Retail", &zero, now).rate, 0.0);

        let none = item(json!({"item_code": "E"}));
        let record = PriceRecord::derive("Retail", &none, now);
        assert_eq!((record.rate, record.price_list_rate, record.timestamp), (0.0, 0.0, now));
    }

    #[tokio::test]
    async fn test_bulk_upsert_prices() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let items = vec![
            item(json!({"item_code": "A", "price_list_rate": 12.5})),
            item(json!({"item_code": "B", "rate": "3.25"})),
        ];

        let outcome = store.bulk_upsert_prices("Retail", &items).await.unwrap();
        assert_eq!(outcome.records, 2);

        let a = store.get_price("Retail", "A").await.unwrap().unwrap();
        assert_eq!(a.rate, 12.5);
        let b = store.get_price("Retail", "B").await.unwrap().unwrap();
        assert_eq!(b.price_list_rate, 3.25);
        assert!(store.get_price("Wholesale", "A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_price_lists_are_independent() {
        let store = RecordStore::open_in_memory().await.unwrap();
        store.bulk_upsert_prices("Retail", &[item(json!({"item_code": "A", "rate": 5}))]).await.unwrap();
        store.bulk_upsert_prices("Wholesale", &[item(json!({"item_code": "A", "rate": 4}))]).await.unwrap();
        store.bulk_upsert_prices("Retail", &[item(json!({"item_code": "A", "rate": 6}))]).await.unwrap();

        let prices = store.prices_for_item("A").await.unwrap();
        let pairs: Vec<_> = prices.iter().map(|p| (p.price_list.as_str(), p.rate)).collect();
        assert_eq!(pairs, vec![("Retail", 6.0), ("Wholesale", 4.0)]);
        assert_eq!(store.price_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_price_list_is_a_no_op() {
        let store = RecordStore::open_in_memory().await.unwrap();
        let outcome = store.bulk_upsert_prices("", &[item(json!({"item_code": "A"}))]).await.unwrap();
        assert_eq!(outcome, BulkWrite::default());
        assert_eq!(store.price_count().await.unwrap(), 0);
    }
}
