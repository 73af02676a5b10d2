//! Property-based tests for JSON flattening
//!
//! Generated documents use lowercase letter keys only, so flattened paths
//! joined with `_` can never collide.

use proptest::prelude::*;
use serde_json::{Map, Value};

use mqtt_dashboard::flatten::{flatten_json, flatten_json_with};

fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        (-1.0e6f64..1.0e6).prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
    ]
}

/// Arbitrary JSON values up to a few levels deep.
fn json_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,5}", inner, 0..5)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>())),
        ]
    })
}

fn object_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-z]{1,5}", json_strategy(), 0..6)
        .prop_map(|m| Value::Object(m.into_iter().collect()))
}

/// Number of entries flattening should produce for the value stored under some key.
fn leaves(value: &Value) -> usize {
    match value {
        Value::Object(map) => map.values().map(leaves).sum(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(_) => leaves(item),
                _ => 1,
            })
            .sum(),
        _ => 1,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Every leaf of the document yields exactly one entry.
    #[test]
    fn property_entry_count_matches_leaves(doc in object_strategy()) {
        let flat = flatten_json(&doc);
        prop_assert_eq!(flat.len(), leaves(&doc));
    }

    /// Objects never survive flattening; arrays survive only as array elements.
    #[test]
    fn property_no_objects_in_output(doc in object_strategy()) {
        for (key, value) in flatten_json(&doc) {
            prop_assert!(!value.is_object(), "object left under {}", key);
        }
    }

    /// Nesting a document under a key prefixes every path with that key.
    #[test]
    fn property_nesting_prefixes_paths(doc in object_strategy(), key in "[a-z]{1,5}") {
        let inner = flatten_json(&doc);
        let mut wrapper = Map::new();
        wrapper.insert(key.clone(), doc);
        let outer = flatten_json(&Value::Object(wrapper));

        prop_assert_eq!(outer.len(), inner.len());
        for ((outer_key, outer_value), (inner_key, inner_value)) in outer.iter().zip(inner.iter()) {
            prop_assert_eq!(outer_key, &format!("{}_{}", key, inner_key));
            prop_assert_eq!(outer_value, inner_value);
        }
    }

    /// A flat object of scalars flattens to itself.
    #[test]
    fn property_flat_object_is_identity(
        map in prop::collection::btree_map("[a-z]{1,5}", scalar_strategy(), 0..8)
    ) {
        let doc = Value::Object(map.into_iter().collect());
        prop_assert_eq!(Value::Object(flatten_json(&doc)), doc);
    }

    /// Array and scalar roots yield nothing.
    #[test]
    fn property_non_object_root_is_empty(value in json_strategy()) {
        prop_assume!(!value.is_object());
        prop_assert!(flatten_json(&value).is_empty());
    }

    /// The separator only changes how paths are joined.
    #[test]
    fn property_separator_is_only_a_joiner(doc in object_strategy()) {
        let underscored: Vec<String> = flatten_json(&doc).keys().cloned().collect();
        let dotted: Vec<String> = flatten_json_with(&doc, ".")
            .keys()
            .map(|k| k.replace('.', "_"))
            .collect();
        prop_assert_eq!(underscored, dotted);
    }
}
