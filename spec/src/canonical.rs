//! Canonical JSON: UTF-8, sorted keys, compact separators, no raw floats.
//!
//! Floating point numbers are rendered with fixed six-decimal precision so
//! two processes hashing the same record always see the same bytes.
//! Non-finite values never appear inside `serde_json::Value`; callers that
//! need them use [`float_token`] which produces the `"inf"`/`"-inf"`/`"nan"`
//! sentinels before the value enters a record.

use serde_json::Value;
use std::fmt::Write;

/// Serialize a JSON value into its canonical textual form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Convert a float into a canonical JSON value: a fixed-precision string for
/// finite inputs, or one of the `"inf"`/`"-inf"`/`"nan"` sentinels.
pub fn float_token(value: f64) -> Value {
    if value.is_nan() {
        return Value::String("nan".to_string());
    }
    if value.is_infinite() {
        let token = if value > 0.0 { "inf" } else { "-inf" };
        return Value::String(token.to_string());
    }
    Value::String(format!("{value:.6}"))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(num) => {
            if let Some(int) = num.as_i64() {
                let _ = write!(out, "{int}");
            } else if let Some(uint) = num.as_u64() {
                let _ = write!(out, "{uint}");
            } else {
                // Finite by construction: serde_json cannot hold NaN/inf.
                let float = num.as_f64().unwrap_or(0.0);
                let _ = write!(out, "\"{float:.6}\"");
            }
        }
        Value::String(text) => {
            // serde_json string escaping is deterministic.
            let encoded = serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string());
            out.push_str(&encoded);
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                let encoded = serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string());
                out.push_str(&encoded);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_and_compacts() {
        let value = json!({"b": 1, "a": {"z": [1, 2], "y": "x"}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":"x","z":[1,2]},"b":1}"#);
    }

    #[test]
    fn floats_render_with_six_decimals() {
        let value = json!({"score": 0.5});
        assert_eq!(canonical_json(&value), r#"{"score":"0.500000"}"#);
    }

    #[test]
    fn float_token_sentinels() {
        assert_eq!(float_token(f64::INFINITY), json!("inf"));
        assert_eq!(float_token(f64::NEG_INFINITY), json!("-inf"));
        assert_eq!(float_token(f64::NAN), json!("nan"));
        assert_eq!(float_token(1.25), json!("1.250000"));
    }

    #[test]
    fn identical_inputs_produce_identical_output() {
        let value = json!({"k": [true, null, "s", 3], "n": {"m": 1}});
        assert_eq!(canonical_json(&value), canonical_json(&value.clone()));
    }
}
