use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, Transaction};
use tokio_rusqlite::params;

use super::derive::{DerivedFields, TokenKind};
use super::{BulkWrite, RecordStore};
use crate::Error;

/// A catalog item.
///
/// `attributes` holds the item as received. The derived lists are
/// recomputed from `attributes` whenever the item is written, so values
/// supplied by a caller are never trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Item {
    pub item_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_group: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(flatten)]
    pub derived: DerivedFields,
}

fn text_field(attributes: &Map<String, Value>, field: &str) -> Option<String> {
    match attributes.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Item {
    /// Build an item from a raw catalog object.
    pub fn from_raw(raw: Value) -> Result<Self, Error> {
        let Value::Object(attributes) = raw else {
            return Err(Error::InvalidInput("item record must be a JSON object".into()));
        };
        let item_code = text_field(&attributes, "item_code")
            .ok_or_else(|| Error::InvalidInput("item record has no item_code".into()))?;

        Ok(Self {
            item_code,
            item_name: attributes.get("item_name").and_then(Value::as_str).map(str::to_string),
            item_group: attributes.get("item_group").and_then(Value::as_str).map(str::to_string),
            derived: DerivedFields::from_attributes(&attributes),
            attributes,
        })
    }

    /// Build items from raw objects, rejecting the whole batch if any is invalid.
    pub fn from_raw_batch(raw: Vec<Value>) -> Result<Vec<Self>, Error> {
        raw.into_iter()
            .enumerate()
            .map(|(index, value)| {
                Item::from_raw(value).map_err(|e| Error::InvalidInput(format!("record {index}: {e}")))
            })
            .collect()
    }
}

fn encode_list(list: &[String]) -> Result<String, Error> {
    Ok(serde_json::to_string(list)?)
}

fn decode_list(json: &str) -> Vec<String> {
    serde_json::from_str(json).unwrap_or_default()
}

fn write_tokens(tx: &Transaction<'_>, item_code: &str, derived: &DerivedFields) -> Result<(), Error> {
    tx.execute("DELETE FROM item_tokens WHERE item_code = ?1", params![item_code])?;
    let mut insert =
        tx.prepare_cached("INSERT OR IGNORE INTO item_tokens (item_code, kind, token) VALUES (?1, ?2, ?3)")?;
    for kind in TokenKind::ALL {
        for token in derived.list(kind) {
            insert.execute(params![item_code, kind.as_str(), token])?;
        }
    }
    Ok(())
}

fn write_derived(tx: &Transaction<'_>, item_code: &str, derived: &DerivedFields) -> Result<(), Error> {
    tx.execute(
        "UPDATE items SET
            barcodes_json = ?2, name_keywords_json = ?3, serials_json = ?4, batches_json = ?5
         WHERE item_code = ?1",
        params![
            item_code,
            encode_list(&derived.barcodes)?,
            encode_list(&derived.name_keywords)?,
            encode_list(&derived.serials)?,
            encode_list(&derived.batches)?,
        ],
    )?;
    write_tokens(tx, item_code, derived)
}

pub(super) fn write_item(tx: &Transaction<'_>, item: &Item, now: &str) -> Result<(), Error> {
    let derived = DerivedFields::from_attributes(&item.attributes);
    tx.execute(
        "INSERT INTO items (item_code, item_name, item_group, attributes_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(item_code) DO UPDATE SET
            item_name = excluded.item_name,
            item_group = excluded.item_group,
            attributes_json = excluded.attributes_json,
            updated_at = excluded.updated_at",
        params![
            &item.item_code,
            &item.item_name,
            &item.item_group,
            serde_json::to_string(&item.attributes)?,
            now,
        ],
    )?;
    write_derived(tx, &item.item_code, &derived)
}

/// Recompute derived lists for every stored item from its attributes.
///
/// Rows whose attributes cannot be read get empty lists.
pub(super) fn rederive(tx: &Transaction<'_>) -> Result<usize, Error> {
    let rows: Vec<(String, String)> = {
        let mut stmt = tx.prepare("SELECT item_code, attributes_json FROM items ORDER BY item_code")?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?
    };

    for (item_code, json) in &rows {
        let attributes = match serde_json::from_str::<Map<String, Value>>(json) {
            Ok(attributes) => attributes,
            Err(e) => {
                tracing::warn!(%item_code, error = %e, "unreadable item attributes, resetting derived lists");
                Map::new()
            }
        };
        write_derived(tx, item_code, &DerivedFields::from_attributes(&attributes))?;
    }
    Ok(rows.len())
}

pub(super) fn rederive_step(tx: &Transaction<'_>) -> Result<(), Error> {
    let count = rederive(tx)?;
    tracing::info!(items = count, "derived item lookup lists");
    Ok(())
}

const ITEM_COLUMNS: &str = "i.item_code, i.item_name, i.item_group, i.attributes_json,
    i.barcodes_json, i.name_keywords_json, i.serials_json, i.batches_json";

fn read_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let attributes: String = row.get(3)?;
    Ok(Item {
        item_code: row.get(0)?,
        item_name: row.get(1)?,
        item_group: row.get(2)?,
        attributes: serde_json::from_str(&attributes).unwrap_or_default(),
        derived: DerivedFields {
            barcodes: decode_list(&row.get::<_, String>(4)?),
            name_keywords: decode_list(&row.get::<_, String>(5)?),
            serials: decode_list(&row.get::<_, String>(6)?),
            batches: decode_list(&row.get::<_, String>(7)?),
        },
    })
}

impl RecordStore {
    /// Insert or replace items in chunked transactions.
    pub async fn bulk_upsert_items(&self, items: Vec<Item>) -> Result<BulkWrite, Error> {
        self.write_chunked("items", items, write_item).await
    }

    /// Recompute every item's derived lists. Running it twice changes nothing.
    pub async fn rederive_items(&self) -> Result<usize, Error> {
        self.conn
            .call(|conn| -> Result<usize, Error> {
                let tx = conn.transaction()?;
                let count = rederive(&tx)?;
                tx.commit()?;
                Ok(count)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn get_item(&self, item_code: &str) -> Result<Option<Item>, Error> {
        let item_code = item_code.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Item>, Error> {
                let sql = format!("SELECT {ITEM_COLUMNS} FROM items i WHERE i.item_code = ?1");
                Ok(conn.query_row(&sql, params![item_code], read_item).optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Items whose derived list of `kind` contains `token`.
    ///
    /// Keyword lookups are case-insensitive.
    pub async fn find_items(&self, kind: TokenKind, token: &str) -> Result<Vec<Item>, Error> {
        let token = match kind {
            TokenKind::Keyword => token.to_lowercase(),
            _ => token.to_string(),
        };
        self.conn
            .call(move |conn| -> Result<Vec<Item>, Error> {
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM items i
                     JOIN item_tokens t ON t.item_code = i.item_code
                     WHERE t.kind = ?1 AND t.token = ?2
                     ORDER BY i.item_code"
                );
                let mut stmt = conn.prepare(&sql)?;
                let items = stmt
                    .query_map(params![kind.as_str(), token], read_item)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn item_count(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|count| count as u64)
            .map_err(Error::from)
    }
}
