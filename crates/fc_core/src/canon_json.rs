//! Canonical JSON: sorted object keys, no insignificant whitespace, integers only.
//!
//! Manifests and conflict snapshots are written in this form so their hashes are stable
//! across replicas and platforms.

use crate::app_error::{AppError, AppResult};
use serde::Serialize;
use serde_json::Value;

fn encode_error(what: &str) -> AppError {
    AppError::new(
        "FC_CANON_JSON_ENCODE_FAILED",
        "canon_json",
        &format!("failed to encode {}", what),
        false,
        serde_json::json!({}),
    )
}

fn write_canonical(value: &Value, out: &mut String) -> AppResult<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if n.is_f64() {
                return Err(AppError::new(
                    "FC_CANON_JSON_FLOAT_FORBIDDEN",
                    "canon_json",
                    "floats are forbidden in canonical json",
                    false,
                    serde_json::json!({}),
                ));
            }
            out.push_str(&n.to_string());
        }
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).map_err(|_| encode_error("string"))?);
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
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
                out.push_str(&serde_json::to_string(key).map_err(|_| encode_error("key"))?);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

pub fn to_canonical_string(value: &Value) -> AppResult<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

pub fn to_canonical_bytes(value: &Value) -> AppResult<Vec<u8>> {
    Ok(to_canonical_string(value)?.into_bytes())
}

/// Serializes any `Serialize` value through `serde_json::Value` into canonical text.
pub fn canonical_string_of<T: Serialize>(value: &T) -> AppResult<String> {
    let value = serde_json::to_value(value).map_err(|e| {
        AppError::new(
            "FC_CANON_JSON_ENCODE_FAILED",
            "canon_json",
            "failed to convert value to json",
            false,
            serde_json::json!({ "error": e.to_string() }),
        )
    })?;
    to_canonical_string(&value)
}

pub fn hash_canonical(value: &Value) -> AppResult<String> {
    let bytes = to_canonical_bytes(value)?;
    Ok(crate::hashing::blake3_hex_prefixed(&bytes))
}
