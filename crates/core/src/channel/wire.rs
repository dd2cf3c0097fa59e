//! JSON envelopes exchanged across a background-context boundary.
//!
//! Requests travel as `{id, type, data}`. Replies travel as `{id, type, data}`
//! on success or `{id, type: "error", error}` on failure. Protocol enums are
//! serde adjacently tagged (`{type, data}`) so the envelope is just the tagged
//! value plus a correlation id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

/// Reply type that marks a named error reply.
pub const ERROR_REPLY: &str = "error";

/// A correlated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A correlated reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a reply settles its pending call.
#[derive(Debug)]
pub enum ReplyOutcome<T> {
    Success(T),
    Failure(String),
    Unrecognized(String),
}

fn split_tagged(value: Value) -> Result<(String, Option<Value>), Error> {
    let Value::Object(mut map) = value else {
        return Err(Error::Protocol("message did not serialize to a tagged object".into()));
    };
    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(Error::Protocol("message has no string 'type' tag".into())),
    };
    Ok((kind, map.remove("data")))
}

fn join_tagged<T: DeserializeOwned>(kind: &str, data: Option<Value>) -> Result<T, serde_json::Error> {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(kind.to_string()));
    if let Some(data) = data {
        map.insert("data".into(), data);
    }
    serde_json::from_value(Value::Object(map))
}

impl RequestEnvelope {
    /// Wrap a protocol request with its correlation id.
    pub fn encode<R: Serialize>(id: u64, request: &R) -> Result<Self, Error> {
        let (kind, data) = split_tagged(serde_json::to_value(request)?)?;
        Ok(Self { id, kind, data })
    }

    /// Decode the carried request into the protocol's closed request enum.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R, Error> {
        join_tagged(&self.kind, self.data.clone())
            .map_err(|e| Error::Protocol(format!("unknown message type '{}': {e}", self.kind)))
    }
}

impl ReplyEnvelope {
    /// Named success reply carrying a protocol response.
    pub fn success<R: Serialize>(id: u64, response: &R) -> Result<Self, Error> {
        let (kind, data) = split_tagged(serde_json::to_value(response)?)?;
        Ok(Self { id, kind, data, error: None })
    }

    /// Named error reply.
    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self { id, kind: ERROR_REPLY.into(), data: None, error: Some(error.into()) }
    }

    /// Classify this reply against the protocol's closed response enum.
    pub fn outcome<T: DeserializeOwned>(self) -> ReplyOutcome<T> {
        if self.kind == ERROR_REPLY {
            return ReplyOutcome::Failure(self.error.unwrap_or_else(|| "unspecified worker error".into()));
        }
        match join_tagged(&self.kind, self.data) {
            Ok(response) => ReplyOutcome::Success(response),
            Err(e) => ReplyOutcome::Unrecognized(format!("unrecognized reply type '{}': {e}", self.kind)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data", rename_all = "snake_case")]
    enum Ping {
        Echo { text: String },
        Cleanup,
    }

    #[test]
    fn test_request_envelope_shape() {
        let envelope = RequestEnvelope::encode(3, &Ping::Echo { text: "hi".into() }).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"id": 3, "type": "echo", "data": {"text": "hi"}}));
    }

    #[test]
    fn test_unit_request_has_no_data() {
        let envelope = RequestEnvelope::encode(1, &Ping::Cleanup).unwrap();
        assert_eq!(envelope.data, None);
        assert_eq!(envelope.decode::<Ping>().unwrap(), Ping::Cleanup);
    }

    #[test]
    fn test_unknown_request_type() {
        let envelope = RequestEnvelope { id: 1, kind: "format_disk".into(), data: None };
        let err = envelope.decode::<Ping>().unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }

    #[test]
    fn test_reply_outcomes() {
        let ok = ReplyEnvelope::success(1, &Ping::Echo { text: "x".into() }).unwrap();
        assert!(matches!(ok.outcome::<Ping>(), ReplyOutcome::Success(Ping::Echo { .. })));

        let failed = ReplyEnvelope::failure(2, "disk full");
        assert!(matches!(failed.outcome::<Ping>(), ReplyOutcome::Failure(msg) if msg == "disk full"));

        let odd = ReplyEnvelope { id: 3, kind: "SOMETHING_ELSE".into(), data: None, error: None };
        assert!(matches!(odd.outcome::<Ping>(), ReplyOutcome::Unrecognized(_)));
    }

    #[test]
    fn test_error_reply_wire_shape() {
        let value = serde_json::to_value(ReplyEnvelope::failure(9, "boom")).unwrap();
        assert_eq!(value, json!({"id": 9, "type": "error", "error": "boom"}));
    }
}
