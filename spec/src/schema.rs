//! Minimal JSON-schema-subset validator used for configuration and
//! plugin settings: type/enum/const, object required/properties/
//! additionalProperties, array items, numeric bounds, and
//! allOf/anyOf/oneOf combinators.

use serde_json::Value;
use thiserror::Error;

/// Validation failure with a JSON-path style location.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{path}: {message}")]
pub struct SchemaError {
    /// Location of the offending value.
    pub path: String,
    /// What failed.
    pub message: String,
}

fn fail(path: &str, message: impl Into<String>) -> Result<(), SchemaError> {
    Err(SchemaError {
        path: path.to_string(),
        message: message.into(),
    })
}

/// Validate `data` against `schema` rooted at `$`.
pub fn validate(schema: &Value, data: &Value) -> Result<(), SchemaError> {
    validate_at(schema, data, "$")
}

fn validate_at(schema: &Value, data: &Value, path: &str) -> Result<(), SchemaError> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };
    if let Some(expected) = schema.get("const") {
        if data != expected {
            return fail(path, format!("value does not match const {expected}"));
        }
    }
    if let Some(options) = schema.get("enum").and_then(Value::as_array) {
        if !options.contains(data) {
            return fail(path, "value not in enum");
        }
    }
    if let Some(expected) = schema.get("type") {
        check_type(expected, data, path)?;
    }
    match data {
        Value::Object(map) => {
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        return fail(path, format!("missing required field {key}"));
                    }
                }
            }
            let properties = schema.get("properties").and_then(Value::as_object);
            let additional = schema.get("additionalProperties");
            for (key, value) in map {
                let child_path = format!("{path}.{key}");
                if let Some(prop_schema) = properties.and_then(|props| props.get(key)) {
                    validate_at(prop_schema, value, &child_path)?;
                } else {
                    match additional {
                        Some(Value::Bool(false)) => {
                            return fail(path, format!("unexpected field {key}"));
                        }
                        Some(extra @ Value::Object(_)) => {
                            validate_at(extra, value, &child_path)?;
                        }
                        _ => {}
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{path}[{idx}]"))?;
                }
            }
        }
        Value::Number(num) => {
            if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
                if num.as_f64().unwrap_or(0.0) < minimum {
                    return fail(path, format!("value below minimum {minimum}"));
                }
            }
            if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
                if num.as_f64().unwrap_or(0.0) > maximum {
                    return fail(path, format!("value above maximum {maximum}"));
                }
            }
        }
        _ => {}
    }
    if let Some(all) = schema.get("allOf").and_then(Value::as_array) {
        for sub in all {
            validate_at(sub, data, path)?;
        }
    }
    if let Some(any) = schema.get("anyOf").and_then(Value::as_array) {
        if !any.iter().any(|sub| validate_at(sub, data, path).is_ok()) {
            return fail(path, "did not match anyOf schema");
        }
    }
    if let Some(one) = schema.get("oneOf").and_then(Value::as_array) {
        let matches = one
            .iter()
            .filter(|sub| validate_at(sub, data, path).is_ok())
            .count();
        if matches != 1 {
            return fail(path, format!("expected oneOf match, got {matches}"));
        }
    }
    Ok(())
}

fn check_type(expected: &Value, data: &Value, path: &str) -> Result<(), SchemaError> {
    match expected {
        Value::Array(options) => {
            if options.iter().any(|opt| check_type(opt, data, path).is_ok()) {
                Ok(())
            } else {
                fail(path, format!("expected one of {options:?}"))
            }
        }
        Value::String(name) => {
            let matches = match name.as_str() {
                "object" => data.is_object(),
                "array" => data.is_array(),
                "string" => data.is_string(),
                "integer" => data.as_i64().is_some() || data.as_u64().is_some(),
                "number" => data.is_number(),
                "boolean" => data.is_boolean(),
                "null" => data.is_null(),
                other => return fail(path, format!("unsupported schema type {other}")),
            };
            if matches {
                Ok(())
            } else {
                fail(path, format!("expected {name}"))
            }
        }
        _ => Ok(()),
    }
}
