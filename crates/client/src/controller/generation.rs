//! Build-version-qualified cache identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One resolved cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheGeneration {
    id: String,
    resolved: bool,
}

impl CacheGeneration {
    /// A generation read from the version descriptor.
    pub fn resolved(id: impl Into<String>) -> Self {
        Self { id: id.into(), resolved: true }
    }

    /// The constant generation used when no descriptor could be read.
    pub fn fallback(id: impl Into<String>) -> Self {
        Self { id: id.into(), resolved: false }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_default(&self) -> bool {
        !self.resolved
    }

    /// Name of the cache namespace owned by this generation.
    pub fn namespace(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.id)
    }

    /// Numeric form of the id. Build versions are epoch-millisecond stamps;
    /// anything else has no timestamp.
    pub fn timestamp(&self) -> Option<i64> {
        self.id.trim().parse::<i64>().ok()
    }

    /// The broadcast announcing this generation. The fallback generation is never announced.
    pub fn version_info(&self) -> Option<ClientMessage> {
        if !self.resolved {
            return None;
        }
        Some(ClientMessage::VersionInfo { version: self.id.clone(), timestamp: self.timestamp() })
    }
}

/// Messages sent from the controller to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "SW_VERSION_INFO")]
    VersionInfo { version: String, timestamp: Option<i64> },
}

/// Extract the build version from a version descriptor body.
///
/// `version` wins over `buildVersion`; empty strings, zero and non-scalar
/// values count as absent.
pub fn parse_descriptor(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    ["version", "buildVersion"].iter().find_map(|field| version_text(value.get(field)?))
}

fn version_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(parse_descriptor(br#"{"version":"1712345678901"}"#), Some("1712345678901".into()));
        assert_eq!(parse_descriptor(br#"{"version":1712345678901}"#), Some("1712345678901".into()));
        assert_eq!(parse_descriptor(br#"{"buildVersion":"abc"}"#), Some("abc".into()));
        assert_eq!(parse_descriptor(br#"{"version":"","buildVersion":"42"}"#), Some("42".into()));
        assert_eq!(parse_descriptor(br#"{"version":0}"#), None);
        assert_eq!(parse_descriptor(br#"{}"#), None);
        assert_eq!(parse_descriptor(b"<html>"), None);
    }

    #[test]
    fn test_namespace_and_timestamp() {
        let generation = CacheGeneration::resolved("1712345678901");
        assert_eq!(generation.namespace("posawesome-cache-"), "posawesome-cache-1712345678901");
        assert_eq!(generation.timestamp(), Some(1_712_345_678_901));
        assert_eq!(CacheGeneration::resolved("v2-beta").timestamp(), None);
    }

    #[test]
    fn test_default_is_not_announced() {
        let fallback = CacheGeneration::fallback("default");
        assert!(fallback.is_default());
        assert_eq!(fallback.version_info(), None);
    }

    #[test]
    fn test_version_info_wire_shape() {
        let info = CacheGeneration::resolved("1700").version_info().unwrap();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"type": "SW_VERSION_INFO", "version": "1700", "timestamp": 1700}));
    }
}
