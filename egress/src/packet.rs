//! Reasoning packets: the only payload shape allowed through the egress
//! gateway. Every packet carries the sanitized query, sanitized facts,
//! the time window, and the token glossary.

use crate::EgressError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A sanitized reasoning packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningPacket {
    /// Packet schema version.
    pub schema_version: u32,
    /// Sanitized query text.
    pub query_sanitized: String,
    /// Sanitized evidence facts.
    pub facts: Vec<Value>,
    /// Time window `{from, to}` the facts cover.
    pub time_window: Value,
    /// Token glossary: token → `{kind}` (never the original values).
    pub tokens: Value,
}

impl ReasoningPacket {
    /// Assemble a packet.
    pub fn new(query_sanitized: String, facts: Vec<Value>, time_window: Value, tokens: Value) -> Self {
        ReasoningPacket {
            schema_version: 1,
            query_sanitized,
            facts,
            time_window,
            tokens,
        }
    }
}

/// Validate a packet against its declared schema: required fields,
/// correct shapes, and a glossary that never carries raw values.
pub fn validate_packet(packet: &Value) -> Result<(), EgressError> {
    let Some(map) = packet.as_object() else {
        return Err(EgressError::Packet("packet must be an object".into()));
    };
    for field in ["schema_version", "query_sanitized", "facts", "time_window", "tokens"] {
        if !map.contains_key(field) {
            return Err(EgressError::Packet(format!("missing field {field}")));
        }
    }
    if !map["query_sanitized"].is_string() {
        return Err(EgressError::Packet("query_sanitized must be a string".into()));
    }
    if !map["facts"].is_array() {
        return Err(EgressError::Packet("facts must be an array".into()));
    }
    if let Some(tokens) = map["tokens"].as_object() {
        for (token, meta) in tokens {
            if meta.get("value").is_some() {
                return Err(EgressError::Packet(format!(
                    "token {token} carries a raw value"
                )));
            }
        }
    } else {
        return Err(EgressError::Packet("tokens must be an object".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_packet_validates() {
        let packet = ReasoningPacket::new(
            "who emailed ⟦ENT:NAME:ABCD⟧".into(),
            vec![json!({"text": "⟦ENT:EMAIL:EFGH⟧ sent notes"})],
            json!({"from": "2026-01-01", "to": "2026-01-02"}),
            json!({"ABCD": {"kind": "NAME"}, "EFGH": {"kind": "EMAIL"}}),
        );
        validate_packet(&serde_json::to_value(&packet).unwrap()).unwrap();
    }

    #[test]
    fn glossary_with_raw_values_is_rejected() {
        let packet = json!({
            "schema_version": 1,
            "query_sanitized": "q",
            "facts": [],
            "time_window": {},
            "tokens": {"ABCD": {"kind": "EMAIL", "value": "a@b.io"}},
        });
        let err = validate_packet(&packet).unwrap_err();
        assert!(matches!(err, EgressError::Packet(_)));
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = validate_packet(&json!({"schema_version": 1})).unwrap_err();
        assert!(err.to_string().contains("missing field"));
    }
}
