//! Cache key derivation.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use stamps_db::SqlParam;

/// Key for a query and its parameters: hex SHA-256 of
/// `query + ":" + json(params)`.
///
/// JSON has no NaN or infinity, so a non-finite float is written as a
/// `{"float": ...}` object, which no other parameter serializes to.
pub fn generate_key(query: &str, params: &[SqlParam]) -> String {
    let params = Value::Array(params.iter().map(key_value).collect()).to_string();

    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b":");
    hasher.update(params.as_bytes());
    hex::encode(hasher.finalize())
}

fn key_value(param: &SqlParam) -> Value {
    match param {
        SqlParam::Float(f) if !f.is_finite() => json!({ "float": f.to_string() }),
        // Finite scalars always serialize.
        other => serde_json::to_value(other).unwrap_or(Value::Null),
    }
}
