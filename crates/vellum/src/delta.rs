//! JSON-form deltas: compute and apply a textual patch between two value
//! trees.
//!
//! The patch is a JSON object mirroring the documents' shapes. At each map
//! path it holds `{"+": v}` for an insert, `{"-": old}` for a delete, a
//! nested object to recurse, or the bare new value as a scalar replace.
//! Replacing a whole map uses the `{"+": ...}` form so a literal object is
//! never mistaken for a nested patch. Arrays diff element-wise (an object
//! keyed by decimal index) when lengths match and are replaced wholesale
//! otherwise. Apply is pure: neither input is mutated.

use serde_json::Value as JsonValue;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::json::{to_json_value, write_json_value};
use crate::value::{Typed, Value};

/// Compute a patch that turns `old` into `new`. `None` means the values
/// are already equal.
pub fn create_delta(old: &Value<'_>, new: &Value<'_>) -> Result<Option<String>> {
    match diff(old, new)? {
        Some(patch) => serde_json::to_string(&patch)
            .map(Some)
            .map_err(|e| Error::JsonSerialize(e.to_string())),
        None => Ok(None),
    }
}

/// Apply a patch produced by [`create_delta`] to `old`, returning the new
/// document's encoded bytes.
pub fn apply_delta(old: &Value<'_>, patch: &str) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    apply_delta_into(old, patch, &mut enc)?;
    enc.finish()
}

/// Like [`apply_delta`] but emitting the result into an existing encoder.
pub fn apply_delta_into(old: &Value<'_>, patch: &str, enc: &mut Encoder) -> Result<()> {
    let patch: JsonValue = serde_json::from_str(patch).map_err(|e| Error::JsonParse {
        offset: 0,
        message: e.to_string(),
    })?;
    let old = to_json_value(old)?;
    let new = apply_patch(&old, &patch)?;
    write_json_value(enc, &new)
}

fn diff(old: &Value<'_>, new: &Value<'_>) -> Result<Option<JsonValue>> {
    match (old.typed(), new.typed()) {
        (Typed::Map(old_map), Typed::Map(new_map)) => {
            let mut patch = serde_json::Map::new();
            for (key, old_item) in old_map.iter() {
                let key = key
                    .string()
                    .ok_or(Error::JsonSerialize("unresolvable map key".into()))?
                    .into_owned();
                match new_map.get(&key) {
                    Some(new_item) => {
                        if let Some(sub) = diff(&old_item, &new_item)? {
                            patch.insert(key, sub);
                        }
                    }
                    None => {
                        patch.insert(key, marker("-", to_json_value(&old_item)?));
                    }
                }
            }
            for (key, new_item) in new_map.iter() {
                let key = key
                    .string()
                    .ok_or(Error::JsonSerialize("unresolvable map key".into()))?;
                if old_map.get(&key).is_none() {
                    patch.insert(key.into_owned(), marker("+", to_json_value(&new_item)?));
                }
            }
            Ok((!patch.is_empty()).then(|| JsonValue::Object(patch)))
        }
        (Typed::Array(old_arr), Typed::Array(new_arr)) if old_arr.count() == new_arr.count() => {
            let mut patch = serde_json::Map::new();
            for (i, (old_item, new_item)) in old_arr.iter().zip(new_arr.iter()).enumerate() {
                if let Some(sub) = diff(&old_item, &new_item)? {
                    patch.insert(i.to_string(), sub);
                }
            }
            Ok((!patch.is_empty()).then(|| JsonValue::Object(patch)))
        }
        _ => {
            if old.is_equal(new) {
                Ok(None)
            } else {
                Ok(Some(replacement(new)?))
            }
        }
    }
}

/// The patch form of a whole-value replacement: bare for anything that
/// cannot be confused with a nested patch, `{"+": ...}` for maps.
fn replacement(new: &Value<'_>) -> Result<JsonValue> {
    let json = to_json_value(new)?;
    if json.is_object() {
        Ok(marker("+", json))
    } else {
        Ok(json)
    }
}

fn marker(sign: &str, value: JsonValue) -> JsonValue {
    let mut obj = serde_json::Map::with_capacity(1);
    obj.insert(sign.to_string(), value);
    JsonValue::Object(obj)
}

/// Is this patch node an insert/delete marker, and which?
fn as_marker(node: &JsonValue) -> Option<(&str, &JsonValue)> {
    let obj = node.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    let (key, value) = obj.iter().next()?;
    matches!(key.as_str(), "+" | "-").then(|| (key.as_str(), value))
}

fn apply_patch(old: &JsonValue, patch: &JsonValue) -> Result<JsonValue> {
    if let Some((sign, value)) = as_marker(patch) {
        return match sign {
            "+" => Ok(value.clone()),
            _ => Err(Error::JsonParse {
                offset: 0,
                message: "delete marker with no enclosing object".into(),
            }),
        };
    }
    let Some(patch_obj) = patch.as_object() else {
        // Bare scalar/array replace.
        return Ok(patch.clone());
    };
    match old {
        JsonValue::Object(old_obj) => {
            let mut result = old_obj.clone();
            for (key, node) in patch_obj {
                match as_marker(node) {
                    Some(("+", value)) => {
                        result.insert(key.clone(), value.clone());
                    }
                    Some(("-", _)) => {
                        result.remove(key);
                    }
                    _ => {
                        let old_item = old_obj.get(key).ok_or(Error::JsonParse {
                            offset: 0,
                            message: format!("patch path '{key}' not in document"),
                        })?;
                        let new_item = apply_patch(old_item, node)?;
                        result.insert(key.clone(), new_item);
                    }
                }
            }
            Ok(JsonValue::Object(result))
        }
        JsonValue::Array(old_items) => {
            let mut result = old_items.clone();
            for (key, node) in patch_obj {
                let index: usize = key.parse().map_err(|_| Error::JsonParse {
                    offset: 0,
                    message: format!("bad array index '{key}' in patch"),
                })?;
                let old_item = old_items.get(index).ok_or(Error::JsonParse {
                    offset: 0,
                    message: format!("patch index {index} out of bounds"),
                })?;
                result[index] = apply_patch(old_item, node)?;
            }
            Ok(JsonValue::Array(result))
        }
        _ => Err(Error::JsonParse {
            offset: 0,
            message: "nested patch against a scalar".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::{from_json, to_json};
    use crate::scope::{Doc, Trust};

    fn doc(json: &str) -> Doc {
        from_json(json).unwrap()
    }

    fn apply_to_doc(old: &Doc, patch: &str) -> Doc {
        let bytes = apply_delta(&old.root(), patch).unwrap();
        Doc::from_data(bytes, Trust::Trusted, None, None).unwrap()
    }

    #[test]
    fn test_no_change() {
        let a = doc(r#"{"a":1}"#);
        let b = doc(r#"{"a":1}"#);
        assert!(create_delta(&a.root(), &b.root()).unwrap().is_none());
    }

    #[test]
    fn test_insert_and_replace() {
        let old = doc(r#"{"a":1}"#);
        let new = doc(r#"{"a":2,"b":[1]}"#);
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();

        let parsed: JsonValue = serde_json::from_str(&patch).unwrap();
        assert_eq!(parsed["a"], JsonValue::from(2));
        assert_eq!(parsed["b"]["+"], serde_json::json!([1]));

        let applied = apply_to_doc(&old, &patch);
        assert!(applied.root().is_equal(&new.root()));
        // Apply is pure: the old document is untouched.
        assert_eq!(to_json(&old.root()).unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_delete() {
        let old = doc(r#"{"a":1,"b":2}"#);
        let new = doc(r#"{"a":1}"#);
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
        let parsed: JsonValue = serde_json::from_str(&patch).unwrap();
        assert_eq!(parsed["b"]["-"], JsonValue::from(2));

        let applied = apply_to_doc(&old, &patch);
        assert!(applied.root().is_equal(&new.root()));
    }

    #[test]
    fn test_nested_and_array_elementwise() {
        let old = doc(r#"{"m":{"x":1,"y":2},"xs":[1,2,3]}"#);
        let new = doc(r#"{"m":{"x":1,"y":9},"xs":[1,7,3]}"#);
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
        let parsed: JsonValue = serde_json::from_str(&patch).unwrap();
        assert_eq!(parsed["m"]["y"], JsonValue::from(9));
        assert_eq!(parsed["xs"]["1"], JsonValue::from(7));

        let applied = apply_to_doc(&old, &patch);
        assert!(applied.root().is_equal(&new.root()));
    }

    #[test]
    fn test_array_length_change_replaces() {
        let old = doc(r#"{"xs":[1,2]}"#);
        let new = doc(r#"{"xs":[1,2,3]}"#);
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
        let parsed: JsonValue = serde_json::from_str(&patch).unwrap();
        assert_eq!(parsed["xs"], serde_json::json!([1, 2, 3]));

        let applied = apply_to_doc(&old, &patch);
        assert!(applied.root().is_equal(&new.root()));
    }

    #[test]
    fn test_map_replacement_uses_marker() {
        let old = doc(r#"{"v":1}"#);
        let new = doc(r#"{"v":{"now":"a map"}}"#);
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
        let applied = apply_to_doc(&old, &patch);
        assert!(applied.root().is_equal(&new.root()));
    }

    #[test]
    fn test_whole_document_scalar_delta() {
        let old = doc("1");
        let new = doc("2");
        let patch = create_delta(&old.root(), &new.root()).unwrap().unwrap();
        assert_eq!(patch, "2");
        let applied = apply_to_doc(&old, &patch);
        assert_eq!(applied.root().as_int(), 2);
    }
}
