//! Order-independent, zero-value-eliding content hashing
//!
//! Used wherever a persisted identity must survive field reordering and the
//! addition of unset optional fields: the NodeClass spec hash stamped into
//! annotations, launch-template names, and selector-keyed caches.
//!
//! The hash is computed over a canonical JSON form: object keys sorted,
//! arrays treated as unordered sets (elements canonicalized then sorted),
//! and zero values (null, empty strings/maps/lists, zero numbers, false)
//! elided. The digest is SHA-256 truncated to 64 bits so it stays compact
//! enough for annotation values and template names.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash any serializable value into a stable 64-bit digest
pub fn content_hash<T: Serialize>(value: &T) -> u64 {
    let json = serde_json::to_value(value).unwrap_or(Value::Null);
    let canonical = canonicalize(json);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

/// Hash a value and render it the way it is persisted in annotations
pub fn content_hash_string<T: Serialize>(value: &T) -> String {
    content_hash(value).to_string()
}

fn canonicalize(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => {
            if b {
                "true".to_string()
            } else {
                String::new()
            }
        }
        Value::Number(n) => {
            if n.as_f64() == Some(0.0) {
                String::new()
            } else {
                n.to_string()
            }
        }
        Value::String(s) => {
            if s.is_empty() {
                String::new()
            } else {
                format!("{s:?}")
            }
        }
        Value::Array(items) => {
            let mut parts: Vec<String> = items
                .into_iter()
                .map(canonicalize)
                .filter(|p| !p.is_empty())
                .collect();
            parts.sort();
            if parts.is_empty() {
                String::new()
            } else {
                format!("[{}]", parts.join(","))
            }
        }
        Value::Object(map) => {
            let mut parts: Vec<String> = map
                .into_iter()
                .filter_map(|(k, v)| {
                    let canon = canonicalize(v);
                    if canon.is_empty() {
                        None
                    } else {
                        Some(format!("{k:?}:{canon}"))
                    }
                })
                .collect();
            parts.sort();
            if parts.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", parts.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Disk {
        category: Option<String>,
        size: i32,
        tags: BTreeMap<String, String>,
    }

    #[test]
    fn unset_optionals_do_not_change_the_hash() {
        let a = Disk {
            category: Some("cloud_essd".to_string()),
            size: 40,
            tags: BTreeMap::new(),
        };
        let b = Disk {
            category: Some("cloud_essd".to_string()),
            size: 40,
            tags: BTreeMap::from([(String::new(), String::new())]),
        };
        // an empty map and a map with only zero entries both elide away
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn slices_hash_as_sets() {
        let a = vec!["sg-1", "sg-2", "sg-3"];
        let b = vec!["sg-3", "sg-1", "sg-2"];
        assert_eq!(content_hash(&a), content_hash(&b));

        let c = vec!["sg-1", "sg-2"];
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn zero_values_elide() {
        #[derive(Serialize)]
        struct S {
            name: String,
            count: i64,
            enabled: bool,
        }
        let zeroed = S {
            name: String::new(),
            count: 0,
            enabled: false,
        };
        let missing: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(content_hash(&zeroed), content_hash(&missing));
    }

    #[test]
    fn digest_is_stable() {
        // persisted in annotations, so the rendering must never drift
        let value = BTreeMap::from([("category", "cloud_essd"), ("name", "node-disk")]);
        assert_eq!(content_hash_string(&value), content_hash_string(&value));
        assert_ne!(content_hash_string(&value), "0");
    }
}
