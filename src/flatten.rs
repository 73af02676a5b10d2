//! JSON flattening for table and chart display.
//!
//! Turns a nested JSON document into a flat `path -> value` mapping. Object
//! keys are joined with a separator; array elements contribute their index.
//! Only objects found inside arrays are flattened further: any other array
//! element (scalars, and arrays nested directly in arrays) is emitted as-is.
//!
//! ```
//! use mqtt_dashboard::flatten::flatten_json;
//! use serde_json::json;
//!
//! let flat = flatten_json(&json!({"a": {"b": 1}, "c": [1, 2]}));
//! assert_eq!(flat["a_b"], json!(1));
//! assert_eq!(flat["c_0"], json!(1));
//! assert_eq!(flat["c_1"], json!(2));
//! ```

use serde_json::{Map, Value};

/// Separator used when none is given.
pub const DEFAULT_SEPARATOR: &str = "_";

/// Flatten `value` with the default `_` separator.
#[must_use]
pub fn flatten_json(value: &Value) -> Map<String, Value> {
    flatten_json_with(value, DEFAULT_SEPARATOR)
}

/// Flatten `value`, joining path segments with `sep`.
///
/// Only an object root produces entries; an array or scalar root yields an
/// empty mapping. Keys keep the order in which they appear in the document.
#[must_use]
pub fn flatten_json_with(value: &Value, sep: &str) -> Map<String, Value> {
    let mut out = Map::new();
    if let Value::Object(obj) = value {
        flatten_object(obj, "", sep, &mut out);
    }
    out
}

fn join(parent: &str, key: &str, sep: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}{sep}{key}")
    }
}

fn flatten_object(obj: &Map<String, Value>, parent: &str, sep: &str, out: &mut Map<String, Value>) {
    for (key, value) in obj {
        let path = join(parent, key, sep);
        match value {
            Value::Object(inner) => flatten_object(inner, &path, sep, out),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{path}{sep}{i}");
                    match item {
                        Value::Object(inner) => flatten_object(inner, &item_path, sep, out),
                        other => {
                            out.insert(item_path, other.clone());
                        }
                    }
                }
            }
            scalar => {
                out.insert(path, scalar.clone());
            }
        }
    }
}
