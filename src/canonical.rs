//! Canonical JSON form for signed content.
//!
//! Signatures never cover a transport encoding. They cover the canonical
//! form of a document's fields: compact JSON with keys in lexicographic
//! order. Two documents with identical key/value pairs canonicalize to the
//! same bytes no matter the order the fields were produced in.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// The fields of a document, keyed in lexicographic order.
///
/// A `BTreeMap` erases insertion order at the type level, so building the
/// same pairs in any order yields the same map and the same canonical form.
pub type FieldMap = BTreeMap<String, Value>;

/// The canonical textual form of a field map.
///
/// This is the string that gets signed and verified, byte for byte.
pub fn to_canonical_json(data: &FieldMap) -> String {
    // compact separators, sorted keys via the map's ordering
    serde_json::to_string(data).expect("field maps serialize to JSON")
}

/// Canonical bytes of any JSON-representable value.
///
/// Top-level object keys are re-keyed through a [`FieldMap`] so the result
/// does not depend on the order the producer emitted them in. Used for
/// content addressing.
pub fn to_canonical_vec<T: Serialize>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    match value {
        Value::Object(map) => {
            let sorted: FieldMap = map.into_iter().collect();
            serde_json::to_vec(&sorted)
        }
        other => serde_json::to_vec(&other),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_insertion_order_is_erased() {
        let mut a = FieldMap::new();
        a.insert("temp".into(), json!(21.5));
        a.insert("device".into(), json!("sensor-1"));
        a.insert("alive".into(), json!(true));

        let mut b = FieldMap::new();
        b.insert("alive".into(), json!(true));
        b.insert("device".into(), json!("sensor-1"));
        b.insert("temp".into(), json!(21.5));

        assert_eq!(to_canonical_json(&a), to_canonical_json(&b));
    }

    #[test]
    fn test_canonical_is_compact_and_sorted() {
        let mut data = FieldMap::new();
        data.insert("b".into(), json!([1, 2]));
        data.insert("a".into(), json!({"y": 1, "x": 2}));

        let text = to_canonical_json(&data);
        assert_eq!(text, r#"{"a":{"x":2,"y":1},"b":[1,2]}"#);
    }

    #[test]
    fn test_canonical_vec_sorts_struct_fields() {
        #[derive(Serialize)]
        struct Weird {
            zebra: u8,
            apple: u8,
        }

        let bytes = to_canonical_vec(&Weird { zebra: 1, apple: 2 }).unwrap();
        assert_eq!(bytes, br#"{"apple":2,"zebra":1}"#);
    }

    #[test]
    fn test_canonical_vec_non_object() {
        let bytes = to_canonical_vec(&vec![3, 1, 2]).unwrap();
        assert_eq!(bytes, b"[3,1,2]");
    }
}
