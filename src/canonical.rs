//! Canonical JSON and SHA-256 digests.
//!
//! Every digest the core compares (release ids, evidence ids, path digests,
//! artifact digests, artifact namespaces) goes through this module so that two
//! hosts hashing the same value always agree.
//!
//! Canonical form: object keys sorted by byte order, arrays kept in order,
//! no insignificant whitespace, strings escaped the way `serde_json` escapes
//! them.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Prefix carried by every digest string.
pub const DIGEST_PREFIX: &str = "sha256:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    /// The value could not be represented as JSON (non-string map keys,
    /// non-finite floats, failing `Serialize` impls).
    #[error("value is not representable as canonical JSON: {0}")]
    Unrepresentable(String),
}

/// Serializes a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // null, bools and numbers have a single serde_json rendering
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

/// Converts any serializable value to canonical JSON text.
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let value =
        serde_json::to_value(value).map_err(|e| CanonicalError::Unrepresentable(e.to_string()))?;
    Ok(canonical_json(&value))
}

/// `sha256:<hex>` of raw bytes.
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("{DIGEST_PREFIX}{}", hex::encode(Sha256::digest(bytes)))
}

/// `sha256:<hex>` of the canonical JSON form of `value`.
///
/// Fails closed: a value that cannot be canonicalized has no digest.
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<String, CanonicalError> {
    let text = to_canonical_string(value)?;
    Ok(sha256_digest(text.as_bytes()))
}

/// True for strings of the form `sha256:` followed by 64 lowercase hex digits.
pub fn is_digest(s: &str) -> bool {
    match s.strip_prefix(DIGEST_PREFIX) {
        Some(hex_part) => {
            hex_part.len() == 64
                && hex_part
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}
