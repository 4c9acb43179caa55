//! Canonical Codec
//!
//! Deterministic byte-for-byte serialization and SHA-256 hashing. Every
//! content-addressing guarantee in this crate bottoms out here.
//!
//! # Canonical form
//!
//! - Object keys sorted lexicographically (byte order)
//! - No incidental whitespace
//! - UTF-8 throughout
//! - Decimals rendered normalized: trailing zeros stripped, at least one
//!   digit on each side of any decimal point
//!
//! Identical logical content always produces identical bytes and therefore an
//! identical hash, regardless of key insertion order or platform.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// Serialize a JSON value tree to canonical bytes.
pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

/// Serialize any `Serialize` type through its JSON value tree to canonical bytes.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, PipelineError> {
    let tree = serde_json::to_value(value)?;
    Ok(canonical_json_bytes(&tree))
}

/// SHA-256 of `bytes` as a lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Render a decimal in canonical text form.
///
/// `rust_decimal` never emits a bare leading or trailing point, so after
/// `normalize()` the remaining rule is that trailing zeros are gone:
/// `1.500` -> `"1.5"`, `100.00` -> `"100"`, `.5` is parsed as `0.5`.
pub fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(key, out);
                out.push(b':');
                // Key came from the map, entry is always present.
                if let Some(v) = map.get(key.as_str()) {
                    write_canonical(v, out);
                }
            }
            out.push(b'}');
        }
    }
}

fn write_json_string(s: &str, out: &mut Vec<u8>) {
    out.push(b'"');
    for c in s.chars() {
        match c {
            '"' => out.extend_from_slice(b"\\\""),
            '\\' => out.extend_from_slice(b"\\\\"),
            '\n' => out.extend_from_slice(b"\\n"),
            '\r' => out.extend_from_slice(b"\\r"),
            '\t' => out.extend_from_slice(b"\\t"),
            c if (c as u32) < 0x20 => {
                out.extend_from_slice(format!("\\u{:04x}", c as u32).as_bytes());
            }
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out.push(b'"');
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_keys_sorted_regardless_of_insertion_order() {
        let a = json!({"zebra": 1, "alpha": 2, "mid": {"b": 1, "a": 2}});
        let b = json!({"alpha": 2, "mid": {"a": 2, "b": 1}, "zebra": 1});

        let bytes_a = canonical_json_bytes(&a);
        let bytes_b = canonical_json_bytes(&b);

        assert_eq!(bytes_a, bytes_b);
        assert_eq!(
            String::from_utf8(bytes_a).unwrap(),
            r#"{"alpha":2,"mid":{"a":2,"b":1},"zebra":1}"#
        );
    }

    #[test]
    fn test_no_incidental_whitespace() {
        let v = json!({"a": [1, 2, {"b": "x y"}]});
        let s = String::from_utf8(canonical_json_bytes(&v)).unwrap();
        assert_eq!(s, r#"{"a":[1,2,{"b":"x y"}]}"#);
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"k": "line\nbreak\t\"quoted\""});
        let s = String::from_utf8(canonical_json_bytes(&v)).unwrap();
        assert_eq!(s, r#"{"k":"line\nbreak\t\"quoted\""}"#);
    }

    #[test]
    fn test_hash_is_stable_for_same_content() {
        let a = json!({"price": "100.5", "qty": "2"});
        let b = json!({"qty": "2", "price": "100.5"});
        assert_eq!(
            sha256_hex(&canonical_json_bytes(&a)),
            sha256_hex(&canonical_json_bytes(&b))
        );
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_decimal_formatting_strips_trailing_zeros() {
        assert_eq!(format_decimal(Decimal::from_str("1.500").unwrap()), "1.5");
        assert_eq!(format_decimal(Decimal::from_str("100.00").unwrap()), "100");
        assert_eq!(format_decimal(Decimal::from_str("0.50").unwrap()), "0.5");
        assert_eq!(format_decimal(Decimal::from_str("-2.250").unwrap()), "-2.25");
    }
}
