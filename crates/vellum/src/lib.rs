//! Vellum is a compact binary encoding for schema-free structured data
//! (nulls, booleans, integers, floats, strings, blobs, arrays, maps) whose
//! serialized form is directly navigable: readers decode values in place
//! from an immutable byte range, with no parse step.
//!
//! - [`Value`] / [`Array`] / [`Map`]: zero-copy navigation.
//! - [`Doc`] / [`Scope`]: ownership of byte ranges and the process-wide
//!   registry that maps raw addresses back to their shared keys and
//!   extern-pointer destinations.
//! - [`SharedKeys`]: out-of-band interning of short map keys as small
//!   integers.
//! - [`Encoder`]: the streaming writer, including string uniquing and
//!   base-document amendment.
//! - [`MutableArray`] / [`MutableMap`]: copy-on-write overlays over
//!   immutable documents.
//! - [`json`], [`delta`], [`KeyPath`], [`DeepIterator`]: JSON conversion,
//!   JSON-form patches, compiled path lookup, and deep traversal.
//!
//! ```
//! use vellum::json::{from_json, to_json};
//!
//! let doc = from_json(r#"{"name": "alice", "age": 30}"#).unwrap();
//! assert_eq!(doc.root().as_map().get("age").unwrap().as_int(), 30);
//! assert_eq!(to_json(&doc.root()).unwrap(), r#"{"age":30,"name":"alice"}"#);
//! ```

pub mod array;
pub mod deep;
pub mod delta;
pub mod encoder;
pub mod error;
pub mod json;
pub mod map;
pub mod mutable;
pub mod path;
pub mod scope;
pub mod shared_keys;
pub mod tag;
pub mod value;

pub use array::{Array, ArrayIter};
pub use deep::{DeepIterator, PathComponent};
pub use encoder::{Encoder, EncoderOptions};
pub use error::{Error, Result};
pub use json::JsonOptions;
pub use map::{KeyRef, Map, MapIter, MapKey};
pub use mutable::{CopyFlags, MutValue, MutableArray, MutableMap, SlotValue};
pub use path::KeyPath;
pub use scope::{Doc, Scope, Trust};
pub use shared_keys::SharedKeys;
pub use value::{Typed, Value, ValueType};
