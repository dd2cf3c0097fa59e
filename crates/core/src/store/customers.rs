use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, Transaction};

use super::{BulkWrite, RecordStore};
use crate::Error;

/// A customer, keyed by `name` and indexed by its contact fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Customer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

fn string_field(attributes: &Map<String, Value>, field: &str) -> Option<String> {
    match attributes.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Customer {
    pub fn from_raw(raw: Value) -> Result<Self, Error> {
        let Value::Object(attributes) = raw else {
            return Err(Error::InvalidInput("customer record must be a JSON object".into()));
        };
        let name = string_field(&attributes, "name")
            .ok_or_else(|| Error::InvalidInput("customer record has no name".into()))?;
        Ok(Self {
            name,
            customer_name: string_field(&attributes, "customer_name"),
            mobile_no: string_field(&attributes, "mobile_no"),
            email_id: string_field(&attributes, "email_id"),
            tax_id: string_field(&attributes, "tax_id"),
            attributes,
        })
    }

    pub fn from_raw_batch(raw: Vec<Value>) -> Result<Vec<Self>, Error> {
        raw.into_iter()
            .enumerate()
            .map(|(index, value)| {
                Customer::from_raw(value).map_err(|e| Error::InvalidInput(format!("record {index}: {e}")))
            })
            .collect()
    }
}

fn write_customer(tx: &Transaction<'_>, customer: &Customer, now: &str) -> Result<(), Error> {
    tx.execute(
        "INSERT INTO customers (name, customer_name, mobile_no, email_id, tax_id, attributes_json, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name) DO UPDATE SET
            customer_name = excluded.customer_name,
            mobile_no = excluded.mobile_no,
            email_id = excluded.email_id,
            tax_id = excluded.tax_id,
            attributes_json = excluded.attributes_json,
            updated_at = excluded.updated_at",
        params![
            &customer.name,
            &customer.customer_name,
            &customer.mobile_no,
            &customer.email_id,
            &customer.tax_id,
            serde_json::to_string(&customer.attributes)?,
            now,
        ],
    )?;
    Ok(())
}

const CUSTOMER_COLUMNS: &str = "name, customer_name, mobile_no, email_id, tax_id, attributes_json";

fn read_customer(row: &Row<'_>) -> rusqlite::Result<Customer> {
    let attributes: String = row.get(5)?;
    Ok(Customer {
        name: row.get(0)?,
        customer_name: row.get(1)?,
        mobile_no: row.get(2)?,
        email_id: row.get(3)?,
        tax_id: row.get(4)?,
        attributes: serde_json::from_str(&attributes).unwrap_or_default(),
    })
}

impl RecordStore {
    pub async fn bulk_upsert_customers(&self, customers: Vec<Customer>) -> Result<BulkWrite, Error> {
        self.write_chunked("customers", customers, write_customer).await
    }

    pub async fn get_customer(&self, name: &str) -> Result<Option<Customer>, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Customer>, Error> {
                let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE name = ?1");
                Ok(conn.query_row(&sql, params![name], read_customer).optional()?)
            })
            .await
            .map_err(Error::from)
    }

    /// Customers whose name or any contact field contains `term`.
    pub async fn search_customers(&self, term: &str, limit: usize) -> Result<Vec<Customer>, Error> {
        let pattern = format!("%{}%", term.trim());
        let limit = limit as i64;
        self.conn
            .call(move |conn| -> Result<Vec<Customer>, Error> {
                let sql = format!(
                    "SELECT {CUSTOMER_COLUMNS} FROM customers
                     WHERE name LIKE ?1 OR customer_name LIKE ?1 OR mobile_no LIKE ?1
                        OR email_id LIKE ?1 OR tax_id LIKE ?1
                     ORDER BY name LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let customers = stmt
                    .query_map(params![pattern, limit], read_customer)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(customers)
            })
            .await
            .map_err(Error::from)
    }

    pub async fn customer_count(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get::<_, i64>(0)))
            .await
            .map(|count| count as u64)
            .map_err(Error::from)
    }
}
