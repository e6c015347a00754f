//! Path codec between nested board documents and the flat wire format.
//!
//! The remote store only holds `string -> string` pairs, so every nested
//! value is addressed by a compound key: the path segments from the world
//! root joined with `|`.
//!
//! ```text
//! {"pieces": {"3": {"x": 10, "faces": ["a.png"]}}}
//!
//!     pieces|3|x        = "10"
//!     pieces|3|faces|0  = "a.png"
//! ```
//!
//! A `null` leaf is written as the tombstone `_NULL_`. Type information is
//! not carried on the wire: numbers and booleans come back as strings, and
//! sequences come back as objects keyed by their decimal index. Readers use
//! [`sequence_items`] and the lenient decoders in [`crate::piece`] to undo
//! that.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::SyncError;

/// Separator between the segments of a compound key.
pub const SEPARATOR: char = '|';

/// Wire value of a deleted (null) leaf.
pub const TOMBSTONE: &str = "_NULL_";

/// Flat key-value form of a document.
///
/// A `BTreeMap` keeps keys in ascending byte order, which puts every key
/// ahead of all of its descendants.
pub type FlatMap = BTreeMap<String, String>;

/// Decoded form of a flat map plus the keys that could not be decoded.
#[derive(Debug, Default)]
pub struct Unflattened {
    pub value: Value,
    pub rejected: Vec<SyncError>,
}

/// Flatten a nested value into compound-key form.
///
/// A non-composite root has no key to live under and flattens to an empty
/// map. Object keys that are empty or contain the separator cannot be
/// addressed and are skipped.
pub fn flatten(value: &Value) -> FlatMap {
    let mut flat = FlatMap::new();
    flatten_into(value, "", &mut flat);
    flat
}

fn flatten_into(value: &Value, base: &str, flat: &mut FlatMap) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if !is_valid_segment(key) {
                    log::warn!("Skipping unaddressable key {key:?} under {base:?}");
                    continue;
                }
                flatten_child(child, extend_path(base, key), flat);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_child(child, extend_path(base, &index.to_string()), flat);
            }
        }
        _ => {}
    }
}

fn flatten_child(child: &Value, key: String, flat: &mut FlatMap) {
    if child.is_object() || child.is_array() {
        flatten_into(child, &key, flat);
    } else {
        flat.insert(key, scalar_to_wire(child));
    }
}

/// Wire representation of a scalar leaf.
pub fn scalar_to_wire(value: &Value) -> String {
    match value {
        Value::Null => TOMBSTONE.to_string(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Composites never reach here from `flatten`.
        other => other.to_string(),
    }
}

/// Rebuild the nested value described by a flat map.
///
/// Keys are applied in ascending order, so a parent leaf (for example the
/// tombstone `pieces|1`) is assigned before `pieces|1|x` turns it into an
/// object. Malformed keys are collected in [`Unflattened::rejected`] and the
/// rest of the map is still decoded.
pub fn unflatten(flat: &FlatMap) -> Unflattened {
    let mut root = Map::new();
    let mut rejected = Vec::new();

    for (key, raw) in flat {
        match split_path(key) {
            Ok(segments) => assign(&mut root, &segments, raw),
            Err(err) => {
                log::debug!("Rejected flat key: {err}");
                rejected.push(err);
            }
        }
    }

    Unflattened {
        value: Value::Object(root),
        rejected,
    }
}

fn assign(root: &mut Map<String, Value>, segments: &[&str], raw: &str) {
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for segment in parents {
        let slot = node
            .entry(*segment)
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(child) = slot else {
            return;
        };
        node = child;
    }

    let leaf_value = if raw == TOMBSTONE {
        Value::Null
    } else {
        Value::String(raw.to_string())
    };
    node.insert((*leaf).to_string(), leaf_value);
}

/// Split a compound key into its segments.
pub fn split_path(key: &str) -> Result<Vec<&str>, SyncError> {
    if key.is_empty() {
        return Err(SyncError::malformed(key, "empty key"));
    }
    let segments: Vec<&str> = key.split(SEPARATOR).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SyncError::malformed(key, "empty path segment"));
    }
    Ok(segments)
}

/// Join segments into a compound key.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    let mut key = String::new();
    for segment in segments {
        if !key.is_empty() {
            key.push(SEPARATOR);
        }
        key.push_str(segment.as_ref());
    }
    key
}

/// Prefix shared by every strict descendant of `key`.
pub fn child_prefix(key: &str) -> String {
    let mut prefix = String::with_capacity(key.len() + 1);
    prefix.push_str(key);
    prefix.push(SEPARATOR);
    prefix
}

fn extend_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        let mut key = child_prefix(base);
        key.push_str(segment);
        key
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains(SEPARATOR)
}

/// Items of a decoded sequence.
///
/// Accepts a real array or an object keyed by decimal indices (what
/// [`unflatten`] produces for sequences), ordered by numeric index.
/// Non-numeric keys are ignored.
pub fn sequence_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => {
            let mut indexed: Vec<(u64, &Value)> = map
                .iter()
                .filter_map(|(k, v)| k.parse::<u64>().ok().map(|i| (i, v)))
                .collect();
            indexed.sort_by_key(|(i, _)| *i);
            indexed.into_iter().map(|(_, v)| v).collect()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    /// The shape a document takes after a trip through the wire: scalars
    /// become strings and sequences become index-keyed objects.
    fn wire_shape(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), wire_shape(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Object(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), wire_shape(v)))
                    .collect(),
            ),
            Value::Null => Value::Null,
            scalar => Value::String(scalar_to_wire(scalar)),
        }
    }

    #[test]
    fn test_flatten_piece_scenario() {
        let doc = json!({"pieces": {"3": {"x": 10, "y": 20, "faces": ["a.png"]}}});
        let flat = flatten(&doc);

        assert_eq!(flat.len(), 3);
        assert_eq!(flat["pieces|3|x"], "10");
        assert_eq!(flat["pieces|3|y"], "20");
        assert_eq!(flat["pieces|3|faces|0"], "a.png");
    }

    #[test]
    fn test_flatten_null_is_tombstone() {
        let flat = flatten(&json!({"pieces": {"3": null}}));
        assert_eq!(flat.len(), 1);
        assert_eq!(flat["pieces|3"], TOMBSTONE);
    }

    #[test]
    fn test_flatten_scalar_root_is_empty() {
        assert!(flatten(&json!(0)).is_empty());
        assert!(flatten(&json!("world")).is_empty());
        assert!(flatten(&Value::Null).is_empty());
    }

    #[test]
    fn test_flatten_does_not_descend_into_strings() {
        let flat = flatten(&json!({"custom_html": "<b>a|b</b>"}));
        assert_eq!(flat["custom_html"], "<b>a|b</b>");
        assert_eq!(flat.len(), 1);
    }

    #[test]
    fn test_flatten_scalar_stringification() {
        let flat = flatten(&json!({"a": true, "b": 1.5, "c": -3, "d": "s"}));
        assert_eq!(flat["a"], "true");
        assert_eq!(flat["b"], "1.5");
        assert_eq!(flat["c"], "-3");
        assert_eq!(flat["d"], "s");
    }

    #[test]
    fn test_flatten_skips_unaddressable_keys() {
        let flat = flatten(&json!({"a|b": 1, "": 2, "ok": 3}));
        assert_eq!(flat.len(), 1);
        assert_eq!(flat["ok"], "3");
    }

    #[test]
    fn test_round_trip_preserves_wire_shape() {
        let doc = json!({
            "__new": 2,
            "pieces": {
                "0": {"faces": ["a.png", "b.png"], "x": 1, "y": 2.5, "lock": 0},
                "1": null,
                "7": {"faces": [], "orientation": 90, "client": "abc"}
            }
        });
        let decoded = unflatten(&flatten(&doc));
        assert!(decoded.rejected.is_empty());

        // An empty sequence has no leaves and therefore no wire presence.
        let mut expected = wire_shape(&doc);
        expected["pieces"]["7"]
            .as_object_mut()
            .unwrap()
            .remove("faces");
        assert_eq!(decoded.value, expected);
    }

    #[test]
    fn test_unflatten_parent_tombstone_then_children() {
        let mut flat = FlatMap::new();
        flat.insert("pieces|1|x".into(), "5".into());
        flat.insert("pieces|1".into(), TOMBSTONE.into());
        flat.insert("pieces|1|y".into(), "6".into());
        flat.insert("pieces|2".into(), "7".into());

        let decoded = unflatten(&flat);
        assert_eq!(
            decoded.value,
            json!({"pieces": {"1": {"x": "5", "y": "6"}, "2": "7"}})
        );
    }

    #[test]
    fn test_unflatten_collects_malformed_keys() {
        let mut flat = FlatMap::new();
        flat.insert("pieces||x".into(), "1".into());
        flat.insert("|lead".into(), "1".into());
        flat.insert("trail|".into(), "1".into());
        flat.insert("pieces|4|x".into(), "9".into());

        let decoded = unflatten(&flat);
        assert_eq!(decoded.rejected.len(), 3);
        assert!(decoded
            .rejected
            .iter()
            .all(|e| matches!(e, SyncError::MalformedPath { .. })));
        assert_eq!(decoded.value, json!({"pieces": {"4": {"x": "9"}}}));
    }

    #[test]
    fn test_unflatten_empty() {
        let decoded = unflatten(&FlatMap::new());
        assert_eq!(decoded.value, json!({}));
    }

    #[test]
    fn test_split_and_join_path() {
        assert_eq!(split_path("pieces|3|x").unwrap(), vec!["pieces", "3", "x"]);
        assert_eq!(join_path(&["pieces", "3", "x"]), "pieces|3|x");
        assert_eq!(join_path::<&str>(&[]), "");
        assert!(split_path("").is_err());
        assert!(split_path("a||b").is_err());
    }

    #[test]
    fn test_child_prefix() {
        assert_eq!(child_prefix("pieces|3"), "pieces|3|");
    }

    #[test]
    fn test_sequence_items_from_object_is_numerically_ordered() {
        let faces = json!({"10": "k.png", "2": "c.png", "0": "a.png", "name": "x"});
        let items: Vec<&str> = sequence_items(&faces)
            .into_iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(items, vec!["a.png", "c.png", "k.png"]);
    }

    #[test]
    fn test_sequence_items_from_array_and_scalar() {
        assert_eq!(sequence_items(&json!(["a", "b"])).len(), 2);
        assert!(sequence_items(&json!("a")).is_empty());
    }

    /// Segments from a tiny alphabet, so sibling keys often share a prefix
    /// (`a` and `ab`, `1` and `10`).
    fn segment() -> impl Strategy<Value = String> {
        "[ab1]{1,2}"
    }

    fn flat_key() -> impl Strategy<Value = String> {
        prop::collection::vec(segment(), 1..4).prop_map(|segments| join_path(&segments))
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z .]{0,6}".prop_map(Value::from),
        ]
    }

    /// Documents without empty containers, which have no wire presence.
    fn document() -> impl Strategy<Value = Value> {
        let node = leaf().prop_recursive(3, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 1..4).prop_map(Value::Array),
                prop::collection::btree_map(segment(), inner, 1..4)
                    .prop_map(|map| Value::Object(map.into_iter().collect())),
            ]
        });
        prop::collection::btree_map(segment(), node, 1..5)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn prop_round_trip_matches_wire_shape(doc in document()) {
            let decoded = unflatten(&flatten(&doc));
            prop_assert!(decoded.rejected.is_empty());
            prop_assert_eq!(decoded.value, wire_shape(&doc));
        }

        #[test]
        fn prop_unflatten_keeps_prefix_siblings(
            pairs in prop::collection::btree_map(flat_key(), "[a-z]{0,4}|_NULL_", 1..16),
        ) {
            // Only keys with no stored ancestor; `a|b` and `a|bc` both stay.
            let flat: FlatMap = pairs
                .iter()
                .filter(|(key, _)| !pairs.keys().any(|other| key.starts_with(&child_prefix(other))))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let decoded = unflatten(&flat);
            prop_assert!(decoded.rejected.is_empty());
            prop_assert_eq!(flatten(&decoded.value), flat);
        }
    }
}
