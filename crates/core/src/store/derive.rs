//! Lookup lists derived from raw catalog attributes.
//!
//! Derivation never fails: a source field with an unexpected shape yields an
//! empty list.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which derived list a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Barcode,
    Keyword,
    Serial,
    Batch,
}

impl TokenKind {
    pub const ALL: [TokenKind; 4] = [TokenKind::Barcode, TokenKind::Keyword, TokenKind::Serial, TokenKind::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Barcode => "barcode",
            TokenKind::Keyword => "keyword",
            TokenKind::Serial => "serial",
            TokenKind::Batch => "batch",
        }
    }
}

/// Derived lookup lists of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DerivedFields {
    #[serde(default)]
    pub barcodes: Vec<String>,
    #[serde(default)]
    pub name_keywords: Vec<String>,
    #[serde(default)]
    pub serials: Vec<String>,
    #[serde(default)]
    pub batches: Vec<String>,
}

impl DerivedFields {
    pub fn from_attributes(attributes: &Map<String, Value>) -> Self {
        Self {
            barcodes: barcodes(attributes.get("item_barcode")),
            name_keywords: name_keywords(attributes.get("item_name")),
            serials: nested_values(attributes.get("serial_no_data"), "serial_no"),
            batches: nested_values(attributes.get("batch_no_data"), "batch_no"),
        }
    }

    pub fn list(&self, kind: TokenKind) -> &[String] {
        match kind {
            TokenKind::Barcode => &self.barcodes,
            TokenKind::Keyword => &self.name_keywords,
            TokenKind::Serial => &self.serials,
            TokenKind::Batch => &self.batches,
        }
    }
}

/// Text of a scalar that counts as present: non-empty strings and non-zero numbers.
fn present_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Barcodes come either as a list of `{barcode}` rows or as one scalar.
pub fn barcodes(source: Option<&Value>) -> Vec<String> {
    match source {
        Some(Value::Array(_)) => nested_values(source, "barcode"),
        Some(scalar) => present_text(scalar).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Lower-cased whitespace-separated words of the item name.
pub fn name_keywords(source: Option<&Value>) -> Vec<String> {
    match source {
        Some(Value::String(name)) => name.to_lowercase().split_whitespace().map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Values of `field` across a list of rows, skipping rows without one.
pub fn nested_values(source: Option<&Value>, field: &str) -> Vec<String> {
    let Some(Value::Array(rows)) = source else {
        return Vec::new();
    };
    rows.iter().filter_map(|row| row.get(field).and_then(present_text)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_name_keywords() {
        let derived = DerivedFields::from_attributes(&attrs(json!({"item_name": "Red  Pen\tFine"})));
        assert_eq!(derived.name_keywords, vec!["red", "pen", "fine"]);
    }

    #[test]
    fn test_barcode_list_skips_empty_rows() {
        let derived = DerivedFields::from_attributes(&attrs(json!({
            "item_barcode": [{"barcode": "A"}, {"barcode": ""}, {"barcode": "B"}, {"uom": "Nos"}]
        })));
        assert_eq!(derived.barcodes, vec!["A", "B"]);
    }

    #[test]
    fn test_scalar_barcode() {
        assert_eq!(barcodes(Some(&json!("8901"))), vec!["8901"]);
        assert_eq!(barcodes(Some(&json!(8901))), vec!["8901"]);
        assert!(barcodes(Some(&json!(""))).is_empty());
        assert!(barcodes(Some(&Value::Null)).is_empty());
        assert!(barcodes(None).is_empty());
    }

    #[test]
    fn test_serials_and_batches() {
        let derived = DerivedFields::from_attributes(&attrs(json!({
            "serial_no_data": [{"serial_no": "SN-1"}, {"serial_no": null}],
            "batch_no_data": [{"batch_no": "B-9"}]
        })));
        assert_eq!(derived.serials, vec!["SN-1"]);
        assert_eq!(derived.batches, vec!["B-9"]);
    }

    #[test]
    fn test_malformed_sources_yield_empty_lists() {
        let derived = DerivedFields::from_attributes(&attrs(json!({
            "item_name": 42,
            "serial_no_data": "SN-1",
            "batch_no_data": {"batch_no": "B"},
            "item_barcode": {"barcode": "A"}
        })));
        assert_eq!(derived, DerivedFields::default());
    }

    #[test]
    fn test_list_by_kind() {
        let derived = DerivedFields { barcodes: vec!["A".into()], ..Default::default() };
        assert_eq!(derived.list(TokenKind::Barcode), ["A".to_string()]);
        assert!(derived.list(TokenKind::Batch).is_empty());
    }
}
