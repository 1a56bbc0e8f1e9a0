//! JSON conversion for vellum documents.
//!
//! # Mapping
//!
//! | vellum      | JSON                                     |
//! |-------------|------------------------------------------|
//! | `null`      | null                                     |
//! | `undefined` | null                                     |
//! | `bool`      | true/false                               |
//! | `int`/`uint`| integer                                  |
//! | `float`     | other number                             |
//! | `data`      | string with `b64:` prefix (valid base64) |
//! | `string`    | other string                             |
//! | `array`     | array                                    |
//! | `map`       | object                                   |
//!
//! Parsing goes through the encoder ([`convert_json`] emits encoder calls
//! for each JSON token), so shared-key interning and string uniquing apply
//! to JSON input like any other write.
//!
//! Output is controlled by [`JsonOptions`]: `canonical` re-sorts map keys
//! by their decoded strings, and `json5` emits unquoted identifier keys
//! and `Infinity`/`NaN` literals.

use std::sync::Arc;

use base64::Engine;
use serde_json::Value as JsonValue;

use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::scope::Doc;
use crate::shared_keys::SharedKeys;
use crate::value::{Typed, Value, MAX_DEPTH};

/// JSON output options.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOptions {
    /// Sort map keys by decoded string on output.
    pub canonical: bool,
    /// Emit JSON5: unquoted identifier keys, non-finite float literals.
    pub json5: bool,
}

/// Parse a JSON string and create a new document.
pub fn from_json(json: &str) -> Result<Doc> {
    from_json_with_shared_keys(json, None)
}

/// Parse a JSON string, interning eligible map keys through `shared_keys`.
pub fn from_json_with_shared_keys(json: &str, shared_keys: Option<Arc<SharedKeys>>) -> Result<Doc> {
    let mut enc = Encoder::new();
    if let Some(sk) = shared_keys {
        enc.set_shared_keys(sk);
    }
    convert_json(&mut enc, json)?;
    enc.finish_doc()
}

/// Parse JSON text directly into an encoder's stream.
///
/// Strings prefixed `b64:` whose remainder decodes as base64 become blobs.
pub fn convert_json(enc: &mut Encoder, json: &str) -> Result<()> {
    let value: JsonValue = serde_json::from_str(json).map_err(|e| Error::JsonParse {
        offset: byte_offset(json, e.line(), e.column()),
        message: e.to_string(),
    })?;
    emit_json_value(enc, &value, 0)
}

/// Emit a `serde_json` tree through an encoder (used by the delta
/// subsystem's apply path).
pub(crate) fn write_json_value(enc: &mut Encoder, value: &JsonValue) -> Result<()> {
    emit_json_value(enc, value, 0)
}

fn emit_json_value(enc: &mut Encoder, value: &JsonValue, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::JsonParse {
            offset: 0,
            message: "JSON nesting too deep".into(),
        });
    }
    match value {
        JsonValue::Null => enc.write_null(),

        JsonValue::Bool(b) => enc.write_bool(*b),

        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                enc.write_int(i)
            } else if let Some(u) = n.as_u64() {
                enc.write_uint(u)
            } else {
                enc.write_double(n.as_f64().unwrap_or(0.0))
            }
        }

        JsonValue::String(s) => {
            if let Some(b64_payload) = s.strip_prefix("b64:") {
                if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(b64_payload) {
                    return enc.write_data(&bytes);
                }
            }
            enc.write_str(s)
        }

        JsonValue::Array(items) => {
            enc.begin_array(items.len())?;
            for item in items {
                emit_json_value(enc, item, depth + 1)?;
            }
            enc.end_array()
        }

        JsonValue::Object(obj) => {
            enc.begin_map(obj.len())?;
            for (key, item) in obj {
                enc.write_key(key)?;
                emit_json_value(enc, item, depth + 1)?;
            }
            enc.end_map()
        }
    }
}

/// Translate serde_json's line/column (1-based) into a byte offset.
fn byte_offset(input: &str, line: usize, column: usize) -> usize {
    let mut remaining = line.saturating_sub(1);
    let mut offset = 0;
    for (i, b) in input.bytes().enumerate() {
        if remaining == 0 {
            break;
        }
        if b == b'\n' {
            remaining -= 1;
            offset = i + 1;
        }
    }
    (offset + column.saturating_sub(1)).min(input.len())
}

/// Convert a value tree to a `serde_json::Value`.
///
/// Blobs become `b64:`-prefixed strings; non-finite floats fail with
/// [`Error::JsonSerialize`].
pub fn to_json_value(value: &Value<'_>) -> Result<JsonValue> {
    to_json_value_at(value, 0)
}

fn to_json_value_at(value: &Value<'_>, depth: usize) -> Result<JsonValue> {
    if depth > MAX_DEPTH {
        return Err(Error::JsonSerialize("value tree too deep".into()));
    }
    match value.typed() {
        Typed::Undefined | Typed::Null => Ok(JsonValue::Null),

        Typed::Bool(b) => Ok(JsonValue::Bool(b)),

        Typed::Int(n) => Ok(JsonValue::Number(n.into())),
        Typed::UInt(n) => Ok(JsonValue::Number(n.into())),

        Typed::Float(x) => float_number(f64::from(x)),
        Typed::Double(x) => float_number(x),

        Typed::Str(s) => Ok(JsonValue::String(s.to_string())),

        Typed::Data(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            Ok(JsonValue::String(format!("b64:{encoded}")))
        }

        Typed::Array(arr) => {
            let mut items = Vec::with_capacity(arr.count());
            for item in arr.iter() {
                items.push(to_json_value_at(&item, depth + 1)?);
            }
            Ok(JsonValue::Array(items))
        }

        Typed::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (key, item) in map.iter() {
                let key = key
                    .string()
                    .ok_or(Error::JsonSerialize("unresolvable map key".into()))?;
                obj.insert(key.into_owned(), to_json_value_at(&item, depth + 1)?);
            }
            Ok(JsonValue::Object(obj))
        }
    }
}

fn float_number(x: f64) -> Result<JsonValue> {
    if !x.is_finite() {
        return Err(Error::JsonSerialize(format!("non-finite float {x}")));
    }
    serde_json::Number::from_f64(x)
        .map(JsonValue::Number)
        .ok_or_else(|| Error::JsonSerialize(format!("unrepresentable float {x}")))
}

/// Convert a value to its canonical JSON text.
pub fn to_json(value: &Value<'_>) -> Result<String> {
    to_json_opts(value, &JsonOptions::default())
}

/// Convert a value to JSON5 text.
pub fn to_json5(value: &Value<'_>) -> Result<String> {
    to_json_opts(
        value,
        &JsonOptions {
            json5: true,
            ..JsonOptions::default()
        },
    )
}

/// Convert a value to JSON text with explicit options.
pub fn to_json_opts(value: &Value<'_>, options: &JsonOptions) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value, options, 0)?;
    Ok(out)
}

fn write_value(
    out: &mut String,
    value: &Value<'_>,
    options: &JsonOptions,
    depth: usize,
) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::JsonSerialize("value tree too deep".into()));
    }
    match value.typed() {
        Typed::Undefined | Typed::Null => {
            out.push_str("null");
            Ok(())
        }
        Typed::Bool(b) => {
            out.push_str(if b { "true" } else { "false" });
            Ok(())
        }
        Typed::Int(n) => {
            out.push_str(&n.to_string());
            Ok(())
        }
        Typed::UInt(n) => {
            out.push_str(&n.to_string());
            Ok(())
        }
        Typed::Float(x) => write_float(out, f64::from(x), options),
        Typed::Double(x) => write_float(out, x, options),
        Typed::Str(s) => write_string(out, s),
        Typed::Data(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            write_string(out, &format!("b64:{encoded}"))
        }
        Typed::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, &item, options, depth + 1)?;
            }
            out.push(']');
            Ok(())
        }
        Typed::Map(map) => {
            let mut pairs: Vec<(String, Value<'_>)> = Vec::with_capacity(map.count());
            for (key, item) in map.iter() {
                let key = key
                    .string()
                    .ok_or(Error::JsonSerialize("unresolvable map key".into()))?;
                pairs.push((key.into_owned(), item));
            }
            if options.canonical {
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
            }
            out.push('{');
            for (i, (key, item)) in pairs.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if options.json5 && is_json5_identifier(key) {
                    out.push_str(key);
                } else {
                    write_string(out, key)?;
                }
                out.push(':');
                write_value(out, item, options, depth + 1)?;
            }
            out.push('}');
            Ok(())
        }
    }
}

fn write_float(out: &mut String, x: f64, options: &JsonOptions) -> Result<()> {
    if x.is_finite() {
        // serde_json's number formatting, for output identical to its own.
        let text = serde_json::to_string(&JsonValue::from(x))
            .map_err(|e| Error::JsonSerialize(e.to_string()))?;
        out.push_str(&text);
        Ok(())
    } else if options.json5 {
        if x.is_nan() {
            out.push_str("NaN");
        } else if x > 0.0 {
            out.push_str("Infinity");
        } else {
            out.push_str("-Infinity");
        }
        Ok(())
    } else {
        Err(Error::JsonSerialize(format!("non-finite float {x}")))
    }
}

fn write_string(out: &mut String, s: &str) -> Result<()> {
    let quoted =
        serde_json::to_string(&JsonValue::String(s.to_string())).map_err(|e| {
            Error::JsonSerialize(e.to_string())
        })?;
    out.push_str(&quoted);
    Ok(())
}

fn is_json5_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_scalars() {
        let doc = from_json("null").unwrap();
        assert!(doc.root().is_null());

        let doc = from_json("true").unwrap();
        assert!(matches!(doc.root().typed(), Typed::Bool(true)));

        let doc = from_json("42").unwrap();
        assert!(matches!(doc.root().typed(), Typed::Int(42)));

        let doc = from_json("-100").unwrap();
        assert!(matches!(doc.root().typed(), Typed::Int(-100)));

        let doc = from_json("9223372036854775807").unwrap();
        assert!(matches!(doc.root().typed(), Typed::Int(i64::MAX)));

        let doc = from_json("18446744073709551615").unwrap();
        assert!(matches!(doc.root().typed(), Typed::UInt(u64::MAX)));

        let doc = from_json("1.25").unwrap();
        assert!((doc.root().as_double() - 1.25).abs() < 1e-12);

        let doc = from_json(r#""hello""#).unwrap();
        assert!(matches!(doc.root().typed(), Typed::Str("hello")));
    }

    #[test]
    fn test_from_json_binary() {
        // "b64:SGVsbG8=" decodes to "Hello"
        let doc = from_json(r#""b64:SGVsbG8=""#).unwrap();
        match doc.root().typed() {
            Typed::Data(b) => assert_eq!(b, b"Hello"),
            other => panic!("expected Data, got {other:?}"),
        }

        // Invalid base64 after b64: stays a string
        let doc = from_json(r#""b64:!!!invalid!!!""#).unwrap();
        assert!(matches!(
            doc.root().typed(),
            Typed::Str("b64:!!!invalid!!!")
        ));
    }

    #[test]
    fn test_from_json_containers() {
        let doc = from_json("[1, 2, 3]").unwrap();
        let arr = doc.root().as_array();
        assert_eq!(arr.count(), 3);
        assert_eq!(arr.get(2).unwrap().as_int(), 3);

        let doc = from_json("[]").unwrap();
        assert!(doc.root().as_array().is_empty());

        let doc = from_json(r#"{"a": 1, "b": 2}"#).unwrap();
        let map = doc.root().as_map();
        assert_eq!(map.get("a").unwrap().as_int(), 1);
        assert_eq!(map.get("b").unwrap().as_int(), 2);

        let doc = from_json("{}").unwrap();
        assert!(doc.root().as_map().is_empty());
    }

    #[test]
    fn test_parse_error_offset() {
        let err = from_json("{\"a\": }").unwrap_err();
        match err {
            Error::JsonParse { offset, .. } => assert_eq!(offset, 6),
            other => panic!("expected JsonParse, got {other:?}"),
        }

        let err = from_json("[1,\n 2,\n oops]").unwrap_err();
        match err {
            Error::JsonParse { offset, .. } => assert_eq!(offset, 9),
            other => panic!("expected JsonParse, got {other:?}"),
        }
    }

    #[test]
    fn test_to_json_scalars() {
        let doc = from_json("null").unwrap();
        assert_eq!(to_json(&doc.root()).unwrap(), "null");

        let doc = from_json("3.5").unwrap();
        assert_eq!(to_json(&doc.root()).unwrap(), "3.5");

        let doc = from_json(r#""hi""#).unwrap();
        assert_eq!(to_json(&doc.root()).unwrap(), r#""hi""#);
    }

    #[test]
    fn test_roundtrip() {
        for text in [
            r#"{"name":"alice","age":30}"#,
            r#"{"name":"alice","scores":[10,20,30]}"#,
            r#"[1,2,3,null,"hello",true]"#,
            r#"{"data":"b64:SGVsbG8gV29ybGQ="}"#,
            r#"{"nested":{"deep":[{"x":1.5}]}}"#,
        ] {
            let doc = from_json(text).unwrap();
            let result = to_json(&doc.root()).unwrap();
            let orig: JsonValue = serde_json::from_str(text).unwrap();
            let back: JsonValue = serde_json::from_str(&result).unwrap();
            assert_eq!(orig, back, "round-trip of {text}");
        }
    }

    #[test]
    fn test_canonical_sorts_decoded_keys() {
        // With shared keys, codes are assigned in write order (z first), so
        // encoded order is z, a; canonical output re-sorts by string.
        let sk = Arc::new(SharedKeys::new());
        let mut enc = Encoder::new();
        enc.set_shared_keys(sk);
        enc.begin_map(2).unwrap();
        enc.write_key("z").unwrap();
        enc.write_int(1).unwrap();
        enc.write_key("a").unwrap();
        enc.write_int(2).unwrap();
        enc.end_map().unwrap();
        let doc = enc.finish_doc().unwrap();
        let plain = to_json(&doc.root()).unwrap();
        assert_eq!(plain, r#"{"z":1,"a":2}"#);
        let canonical = to_json_opts(
            &doc.root(),
            &JsonOptions {
                canonical: true,
                ..JsonOptions::default()
            },
        )
        .unwrap();
        assert_eq!(canonical, r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn test_json5_output() {
        let doc = from_json(r#"{"plain": 1, "needs quoting": 2}"#).unwrap();
        let json5 = to_json5(&doc.root()).unwrap();
        assert_eq!(json5, r#"{"needs quoting":2,plain:1}"#);
    }

    #[test]
    fn test_non_finite_floats() {
        let mut enc = Encoder::new();
        enc.write_double(f64::INFINITY).unwrap();
        let doc = enc.finish_doc().unwrap();
        assert!(matches!(
            to_json(&doc.root()),
            Err(Error::JsonSerialize(_))
        ));
        assert_eq!(to_json5(&doc.root()).unwrap(), "Infinity");

        let mut enc = Encoder::new();
        enc.write_double(f64::NAN).unwrap();
        let doc = enc.finish_doc().unwrap();
        assert_eq!(to_json5(&doc.root()).unwrap(), "NaN");
    }

    #[test]
    fn test_undefined_prints_null() {
        assert_eq!(to_json(&Value::undefined()).unwrap(), "null");
    }
}
