//! The egress sanitizer: detects entities, replaces them with keyed
//! tokens, tracks the token glossary, and supports exact detokenization
//! and leak checking.

use crate::hasher::{EntityHasher, EntityMap};
use crate::recognizers::{find_entities, RecognizerConfig};
use crate::EgressError;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Token rendering format; `{type}` and `{token}` are substituted.
pub const DEFAULT_TOKEN_FORMAT: &str = "⟦ENT:{type}:{token}⟧";

/// Result of sanitizing one text.
#[derive(Debug, Clone)]
pub struct SanitizedText {
    /// Text with entity spans replaced by tokens.
    pub text: String,
    /// Tokens minted for this text: `token → (value, kind)`.
    pub tokens: Vec<(String, String, String)>,
}

/// The sanitizer.
pub struct EgressSanitizer {
    hasher: EntityHasher,
    recognizers: RecognizerConfig,
    token_format: String,
    map: Mutex<EntityMap>,
}

impl EgressSanitizer {
    /// Sanitizer over a derived key and recognizer config.
    pub fn new(hasher: EntityHasher, recognizers: RecognizerConfig) -> Self {
        EgressSanitizer {
            hasher,
            recognizers,
            token_format: DEFAULT_TOKEN_FORMAT.to_string(),
            map: Mutex::new(EntityMap::default()),
        }
    }

    /// Override the token format.
    pub fn with_token_format(mut self, format: impl Into<String>) -> Self {
        self.token_format = format.into();
        self
    }

    /// Sanitize one text under a scope.
    pub fn sanitize_text(&self, text: &str, scope: &str) -> Result<SanitizedText, EgressError> {
        let entities = find_entities(text, &self.recognizers)?;
        if entities.is_empty() {
            return Ok(SanitizedText {
                text: text.to_string(),
                tokens: Vec::new(),
            });
        }
        let mut map = self.map.lock();
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0usize;
        let mut tokens = Vec::new();
        for entity in entities {
            out.push_str(&text[cursor..entity.start]);
            let token = self
                .hasher
                .token_for(&entity.value, entity.kind.as_str(), scope, &map);
            map.put(&token, &entity.value, entity.kind.as_str());
            out.push_str(&self.render(entity.kind.as_str(), &token));
            tokens.push((token, entity.value, entity.kind.as_str().to_string()));
            cursor = entity.end;
        }
        out.push_str(&text[cursor..]);
        Ok(SanitizedText { text: out, tokens })
    }

    /// Sanitize every string inside a JSON payload. Returns the payload
    /// with `_tokens` and `_glossary` attached.
    pub fn sanitize_payload(&self, payload: &Value, scope: &str) -> Result<Value, EgressError> {
        let mut tokens: Vec<(String, String, String)> = Vec::new();
        let mut sanitized = self.sanitize_value(payload, scope, &mut tokens)?;
        let glossary: Vec<Value> = tokens
            .iter()
            .map(|(token, _value, kind)| json!({"token": token, "kind": kind}))
            .collect();
        let token_map: serde_json::Map<String, Value> = tokens
            .iter()
            .map(|(token, value, kind)| {
                (token.clone(), json!({"value": value, "kind": kind}))
            })
            .collect();
        if let Some(map) = sanitized.as_object_mut() {
            map.insert("_tokens".to_string(), Value::Object(token_map));
            map.insert("_glossary".to_string(), Value::Array(glossary));
            Ok(sanitized)
        } else {
            Ok(json!({
                "payload": sanitized,
                "_tokens": Value::Object(token_map),
                "_glossary": glossary,
            }))
        }
    }

    /// Exact inverse of sanitization for text this sanitizer produced.
    pub fn detokenize_text(&self, text: &str) -> String {
        let map = self.map.lock();
        let mut out = text.to_string();
        for (token, (value, kind)) in map.all() {
            let rendered = self.render(kind, token);
            out = out.replace(&rendered, value);
        }
        out
    }

    /// Detokenize every string inside a payload.
    pub fn detokenize_payload(&self, payload: &Value) -> Value {
        match payload {
            Value::String(text) => Value::String(self.detokenize_text(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.detokenize_payload(item)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), self.detokenize_payload(value)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// True iff no original entity value appears as a substring anywhere
    /// in the sanitized payload (ignoring the `_tokens` bookkeeping).
    pub fn leak_check(&self, sanitized: &Value) -> bool {
        let map = self.map.lock();
        let mut haystack = Vec::new();
        collect_strings(sanitized, true, &mut haystack);
        for (value, _kind) in map.all().values() {
            if value.is_empty() {
                continue;
            }
            if haystack.iter().any(|text| text.contains(value.as_str())) {
                return false;
            }
        }
        true
    }

    fn sanitize_value(
        &self,
        value: &Value,
        scope: &str,
        tokens: &mut Vec<(String, String, String)>,
    ) -> Result<Value, EgressError> {
        Ok(match value {
            Value::String(text) => {
                let result = self.sanitize_text(text, scope)?;
                tokens.extend(result.tokens);
                Value::String(result.text)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value(item, scope, tokens))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, item)| {
                        Ok((key.clone(), self.sanitize_value(item, scope, tokens)?))
                    })
                    .collect::<Result<_, EgressError>>()?,
            ),
            other => other.clone(),
        })
    }

    fn render(&self, kind: &str, token: &str) -> String {
        self.token_format
            .replace("{type}", kind)
            .replace("{token}", token)
    }
}

fn collect_strings(value: &Value, skip_bookkeeping: bool, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.push(text.clone()),
        Value::Array(items) => {
            for item in items {
                collect_strings(item, false, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                if skip_bookkeeping && (key == "_tokens" || key == "_glossary") {
                    continue;
                }
                collect_strings(item, false, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> EgressSanitizer {
        EgressSanitizer::new(EntityHasher::new([9u8; 32]), RecognizerConfig::default())
    }

    #[test]
    fn sanitize_replaces_email_and_phone_with_tokens() {
        let sanitizer = sanitizer();
        let input = "Contact John Doe at john@example.com or 555-123-4567.";
        let result = sanitizer.sanitize_text(input, "default").unwrap();
        assert!(result.text.contains("⟦ENT:EMAIL:"));
        assert!(result.text.contains("⟦ENT:PHONE:"));
        assert!(result.text.contains("⟦ENT:NAME:"));
        assert!(!result.text.contains("john@example.com"));
        assert!(!result.text.contains("555-123-4567"));
    }

    #[test]
    fn detokenize_restores_original() {
        let sanitizer = sanitizer();
        let input = "Contact John Doe at john@example.com or 555-123-4567.";
        let result = sanitizer.sanitize_text(input, "default").unwrap();
        assert_eq!(sanitizer.detokenize_text(&result.text), input);
    }

    #[test]
    fn leak_check_passes_on_sanitized_payload() {
        let sanitizer = sanitizer();
        let payload = json!({"query": "mail john@example.com", "limit": 5});
        let sanitized = sanitizer.sanitize_payload(&payload, "default").unwrap();
        assert!(sanitizer.leak_check(&sanitized));
        assert!(sanitized["_glossary"].as_array().unwrap().len() == 1);
    }

    #[test]
    fn leak_check_fails_when_raw_value_remains() {
        let sanitizer = sanitizer();
        let _ = sanitizer
            .sanitize_text("reach me at jane@example.com", "default")
            .unwrap();
        let leaky = json!({"note": "jane@example.com slipped through"});
        assert!(!sanitizer.leak_check(&leaky));
    }

    #[test]
    fn identical_values_share_a_token_across_calls() {
        let sanitizer = sanitizer();
        let first = sanitizer.sanitize_text("a@b.io wrote", "default").unwrap();
        let second = sanitizer.sanitize_text("ping a@b.io again", "default").unwrap();
        assert_eq!(first.tokens[0].0, second.tokens[0].0);
    }

    proptest::proptest! {
        #[test]
        fn detokenize_inverts_sanitize_for_arbitrary_text(
            prefix in "[a-z ]{0,24}",
            user in "[a-z]{1,8}",
            host in "[a-z]{1,8}",
            suffix in "[a-z ]{0,24}",
        ) {
            let sanitizer = sanitizer();
            let input = format!("{prefix} {user}@{host}.com {suffix}");
            let result = sanitizer.sanitize_text(&input, "default").unwrap();
            let needle = format!("{user}@{host}.com", user = user, host = host);
            let contains_needle = result.text.contains(&needle);
            proptest::prop_assert!(!contains_needle);
            proptest::prop_assert_eq!(sanitizer.detokenize_text(&result.text), input);
        }
    }

    #[test]
    fn payload_roundtrip_is_exact() {
        let sanitizer = sanitizer();
        let payload = json!({
            "facts": ["John Doe emailed john@example.com"],
            "window": {"from": "2026-01-01"},
        });
        let sanitized = sanitizer.sanitize_payload(&payload, "default").unwrap();
        let mut stripped = sanitized.clone();
        if let Some(map) = stripped.as_object_mut() {
            map.remove("_tokens");
            map.remove("_glossary");
        }
        assert_eq!(sanitizer.detokenize_payload(&stripped), payload);
    }
}
