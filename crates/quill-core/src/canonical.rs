//! Canonical JSON serialization and hashing.
//!
//! Signed views must hash identically across implementations, so mappings are
//! serialized with keys in ascending code-point order and no insignificant
//! whitespace. The signable value space is deliberately restricted: integers
//! in the `i64` range, booleans, `null`, strings, arrays, and nested
//! mappings. Floating-point numbers are rejected outright, and any character
//! outside printable ASCII is emitted as a `\uXXXX` escape so the canonical
//! byte stream is always pure ASCII.

use crate::{Policy, QuillError, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically.
///
/// # Errors
///
/// Returns [`QuillError::Canonical`] for floating-point or out-of-range
/// numbers, which have no stable cross-implementation representation.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

/// SHA-256 hex digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the canonical serialization of a value.
pub fn hash_canonical(value: &Value) -> Result<String> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// SHA-256 hex over the canonical serialization of a policy.
///
/// This is the `policy_hash` pinned into every audit record to prove which
/// rules were in force when the record was signed.
pub fn policy_hash(policy: &Policy) -> Result<String> {
    let value = serde_json::to_value(policy)?;
    hash_canonical(&value)
}

fn write_value(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            let Some(i) = n.as_i64() else {
                return Err(QuillError::Canonical(format!(
                    "number {n} is not an i64; floats are not signable"
                )));
            };
            out.push_str(&i.to_string());
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's Map preserves insertion order, so collect and
            // sort; String comparison is code-point order for UTF-8.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Escape a string so the output is pure ASCII: the two JSON metacharacters,
/// the short control escapes, `\uXXXX` for remaining control characters, and
/// `\uXXXX` (UTF-16 code units) for anything above `~`.
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\x08' => out.push_str("\\b"),
            '\x0c' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (' '..='~').contains(&c) => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{unit:04x}"));
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars() {
        assert_eq!(canonical_json(&json!(null)).unwrap(), "null");
        assert_eq!(canonical_json(&json!(true)).unwrap(), "true");
        assert_eq!(canonical_json(&json!(false)).unwrap(), "false");
        assert_eq!(canonical_json(&json!(0)).unwrap(), "0");
        assert_eq!(canonical_json(&json!(-7)).unwrap(), "-7");
        assert_eq!(
            canonical_json(&json!(i64::MAX)).unwrap(),
            i64::MAX.to_string()
        );
    }

    #[test]
    fn test_floats_rejected() {
        assert!(canonical_json(&json!(1.5)).is_err());
        assert!(canonical_json(&json!({"x": 0.1})).is_err());
        // u64 values above i64::MAX are also out of the signable range
        assert!(canonical_json(&json!(u64::MAX)).is_err());
    }

    #[test]
    fn test_key_sorting() {
        let value = json!({"zulu": 1, "alpha": 2, "mike": 3});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"alpha":2,"mike":3,"zulu":1}"#
        );
    }

    #[test]
    fn test_nested_sorting() {
        let value = json!({"outer": {"z": 1, "a": [1, {"b": null}]}});
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"outer":{"a":[1,{"b":null}],"z":1}}"#
        );
    }

    #[test]
    fn test_deterministic_across_clones() {
        let value = json!({"b": 1, "a": {"d": true, "c": "x"}});
        let clone = value.clone();
        assert_eq!(
            canonical_json(&value).unwrap(),
            canonical_json(&clone).unwrap()
        );
        // Insertion order must not matter
        let reordered = json!({"a": {"c": "x", "d": true}, "b": 1});
        assert_eq!(
            canonical_json(&value).unwrap(),
            canonical_json(&reordered).unwrap()
        );
    }

    #[test]
    fn test_string_escaping() {
        assert_eq!(canonical_json(&json!("plain")).unwrap(), r#""plain""#);
        assert_eq!(canonical_json(&json!("a\"b")).unwrap(), r#""a\"b""#);
        assert_eq!(canonical_json(&json!("a\\b")).unwrap(), r#""a\\b""#);
        assert_eq!(canonical_json(&json!("a\nb")).unwrap(), r#""a\nb""#);
        assert_eq!(canonical_json(&json!("\x01")).unwrap(), "\"\\u0001\"");
    }

    #[test]
    fn test_non_ascii_escaped_to_ascii() {
        let out = canonical_json(&json!("héllo")).unwrap();
        assert_eq!(out, "\"h\\u00e9llo\"");
        assert!(out.is_ascii());
        // Astral characters become surrogate pairs
        let out = canonical_json(&json!("𝕏")).unwrap();
        assert_eq!(out, "\"\\ud835\\udd4f\"");
    }

    #[test]
    fn test_sha256_hex() {
        // Known vector: SHA-256 of the empty string
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_canonical_stable_under_reordering() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
        assert_ne!(
            hash_canonical(&a).unwrap(),
            hash_canonical(&json!({"x": 1, "y": 3})).unwrap()
        );
    }

    #[test]
    fn test_policy_hash_changes_with_rules() {
        let base = Policy::default();
        let mut stricter = base.clone();
        stricter.servers[0].default_action = crate::Action::Deny;
        assert_ne!(
            policy_hash(&base).unwrap(),
            policy_hash(&stricter).unwrap()
        );
        assert_eq!(policy_hash(&base).unwrap(), policy_hash(&base).unwrap());
    }
}
