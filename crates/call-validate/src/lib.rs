//! Argument schema validation.
//!
//! Schemas are plain JSON-Schema-shaped `serde_json::Value`s restricted to
//! the subset the dispatcher actually needs: `object` schemas with
//! `properties`, `required`, per-property `type`/`default`, and an optional
//! top-level `additionalProperties: false` for strict rejection of unknown
//! fields. There is deliberately no general-purpose schema engine here —
//! the CALL core only ever validates flat argument records.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use call_error::{CallError, ErrorCode};
use serde_json::{Map, Value};
use tracing::trace;

/// Validate `args` against `schema`, returning a normalized record with
/// documented defaults filled in.
///
/// # Errors
///
/// Returns `SCHEMA_VALIDATION_FAILED` on the first offending path: a
/// missing required property, a type mismatch, or (when the schema sets
/// `additionalProperties: false`) an unrecognized property.
pub fn validate_args(schema: &Value, args: &Value) -> Result<Value, CallError> {
    let args_obj = args
        .as_object()
        .ok_or_else(|| schema_error("$", "expected an object"))?;
    let properties = schema.get("properties").and_then(Value::as_object);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let strict = schema.get("additionalProperties") == Some(&Value::Bool(false));

    let mut normalized = Map::new();

    if let Some(properties) = properties {
        for (name, prop_schema) in properties {
            let path = format!("$.{name}");
            match args_obj.get(name) {
                Some(value) => {
                    check_type(&path, prop_schema, value)?;
                    normalized.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(default) = prop_schema.get("default") {
                        normalized.insert(name.clone(), default.clone());
                    } else if required.contains(&name.as_str()) {
                        return Err(schema_error(&path, "missing required property"));
                    }
                }
            }
        }
    } else {
        normalized = args_obj.clone();
    }

    if strict {
        if let Some(properties) = properties {
            for key in args_obj.keys() {
                if !properties.contains_key(key) {
                    return Err(schema_error(&format!("$.{key}"), "unrecognized property"));
                }
            }
        }
    }

    trace!(fields = normalized.len(), "validated argument record");
    Ok(Value::Object(normalized))
}

fn check_type(path: &str, prop_schema: &Value, value: &Value) -> Result<(), CallError> {
    let Some(expected) = prop_schema.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let matches = match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(schema_error(
            path,
            &format!("expected type {expected}, found {}", type_name(value)),
        ))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn schema_error(path: &str, message: &str) -> CallError {
    CallError::new(
        ErrorCode::SchemaValidationFailed,
        format!("{path}: {message}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn listing_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {"type": "integer", "default": 20},
                "query": {"type": "string"}
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    #[test]
    fn fills_in_documented_default() {
        let result = validate_args(&listing_schema(), &json!({"query": "rust"})).unwrap();
        assert_eq!(result["limit"], json!(20));
        assert_eq!(result["query"], json!("rust"));
    }

    #[test]
    fn rejects_missing_required_property() {
        let err = validate_args(&listing_schema(), &json!({})).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaValidationFailed);
        assert!(err.message.contains("$.query"));
    }

    #[test]
    fn rejects_unrecognized_property_on_strict_schema() {
        let err = validate_args(&listing_schema(), &json!({"query": "x", "bogus": 1}))
            .unwrap_err();
        assert!(err.message.contains("$.bogus"));
    }

    #[test]
    fn does_not_coerce_numbers_from_strings() {
        let err =
            validate_args(&listing_schema(), &json!({"query": "x", "limit": "20"})).unwrap_err();
        assert!(err.message.contains("$.limit"));
    }

    #[test]
    fn rejects_non_object_argument_payload() {
        let err = validate_args(&listing_schema(), &json!("not an object")).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaValidationFailed);
    }

    #[test]
    fn permissive_schema_without_properties_passes_through() {
        let schema = json!({"type": "object"});
        let args = json!({"anything": true, "goes": 1});
        let result = validate_args(&schema, &args).unwrap();
        assert_eq!(result, args);
    }

    proptest::proptest! {
        #[test]
        fn valid_queries_of_any_length_pass(query in "\\PC{0,64}") {
            let result = validate_args(&listing_schema(), &json!({"query": query.clone()}));
            prop_assert!(result.is_ok());
            prop_assert_eq!(result.unwrap()["query"].as_str().unwrap(), query);
        }
    }
}
