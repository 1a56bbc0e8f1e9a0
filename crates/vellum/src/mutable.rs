//! Mutable overlay containers.
//!
//! A [`MutableArray`] or [`MutableMap`] wraps an optional immutable source
//! and overrides slots lazily, exposing the union of untouched source
//! items and edits. Overridden slots hold owned scalars, retained
//! immutable values (together with their [`Doc`], which keeps the backing
//! bytes alive), or nested mutable containers. Mutable trees are owned by
//! a single writing context; mutation flows through `&mut`.
//!
//! Handing a mutable container to an encoder does not freeze it; callers
//! must not mutate during encode.

use std::collections::BTreeMap;

use crate::encoder::Encoder;
use crate::error::Result;
use crate::scope::Doc;
use crate::value::{Typed, Value};

/// Copy behavior for mutable copies of containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFlags {
    /// Recursively produce new mutables down to scalars.
    pub deep: bool,
    /// Clone immutable children into owned form instead of retaining them.
    pub copy_immutables: bool,
}

/// A retained immutable value: the owning Doc plus the value's offset.
#[derive(Debug, Clone)]
struct SavedValue {
    doc: Doc,
    offset: u32,
}

impl SavedValue {
    fn capture(value: &Value<'_>) -> Option<Self> {
        Doc::containing(value).map(|doc| Self {
            doc,
            offset: value.offset(),
        })
    }

    fn value(&self) -> Value<'_> {
        Value::at(self.doc.data(), self.offset).unwrap_or_else(|| Value::undefined())
    }
}

/// An overlay slot.
#[derive(Debug)]
enum Stored {
    /// Array only: fall through to the source at the same index.
    Inherited,
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Data(Vec<u8>),
    /// Retained immutable value from some Doc.
    Saved(SavedValue),
    Array(Box<MutableArray>),
    Map(Box<MutableMap>),
}

/// A value being assigned into a mutable slot. Constructed via `From`
/// impls from scalars, strings, blobs, immutable [`Value`]s, and owned
/// mutable containers.
pub struct SlotValue(Stored);

impl From<()> for SlotValue {
    fn from((): ()) -> Self {
        SlotValue(Stored::Null)
    }
}

impl SlotValue {
    /// The undefined value (distinct from null).
    #[must_use]
    pub fn undefined() -> Self {
        SlotValue(Stored::Undefined)
    }
}

impl From<bool> for SlotValue {
    fn from(v: bool) -> Self {
        SlotValue(Stored::Bool(v))
    }
}

impl From<i64> for SlotValue {
    fn from(v: i64) -> Self {
        SlotValue(Stored::Int(v))
    }
}

impl From<i32> for SlotValue {
    fn from(v: i32) -> Self {
        SlotValue(Stored::Int(i64::from(v)))
    }
}

impl From<u64> for SlotValue {
    fn from(v: u64) -> Self {
        SlotValue(Stored::UInt(v))
    }
}

impl From<f32> for SlotValue {
    fn from(v: f32) -> Self {
        SlotValue(Stored::Float(v))
    }
}

impl From<f64> for SlotValue {
    fn from(v: f64) -> Self {
        SlotValue(Stored::Double(v))
    }
}

impl From<&str> for SlotValue {
    fn from(v: &str) -> Self {
        SlotValue(Stored::Str(v.to_string()))
    }
}

impl From<String> for SlotValue {
    fn from(v: String) -> Self {
        SlotValue(Stored::Str(v))
    }
}

impl From<&[u8]> for SlotValue {
    fn from(v: &[u8]) -> Self {
        SlotValue(Stored::Data(v.to_vec()))
    }
}

impl From<MutableArray> for SlotValue {
    fn from(v: MutableArray) -> Self {
        SlotValue(Stored::Array(Box::new(v)))
    }
}

impl From<MutableMap> for SlotValue {
    fn from(v: MutableMap) -> Self {
        SlotValue(Stored::Map(Box::new(v)))
    }
}

impl From<Value<'_>> for SlotValue {
    /// Retains the value's Doc. A value with no registered Doc is copied
    /// into owned form instead (its bytes cannot be kept alive otherwise).
    fn from(v: Value<'_>) -> Self {
        match SavedValue::capture(&v) {
            Some(saved) => SlotValue(Stored::Saved(saved)),
            None => SlotValue(own_value(&v)),
        }
    }
}

/// Deep-copy an immutable value into owned overlay form.
fn own_value(v: &Value<'_>) -> Stored {
    match v.typed() {
        Typed::Undefined => Stored::Undefined,
        Typed::Null => Stored::Null,
        Typed::Bool(b) => Stored::Bool(b),
        Typed::Int(n) => Stored::Int(n),
        Typed::UInt(n) => Stored::UInt(n),
        Typed::Float(x) => Stored::Float(x),
        Typed::Double(x) => Stored::Double(x),
        Typed::Str(s) => Stored::Str(s.to_string()),
        Typed::Data(b) => Stored::Data(b.to_vec()),
        Typed::Array(arr) => {
            let mut out = MutableArray::new();
            for item in arr.iter() {
                out.items.push(own_value(&item));
            }
            Stored::Array(Box::new(out))
        }
        Typed::Map(map) => {
            let mut out = MutableMap::new();
            for (key, item) in map.iter() {
                let key = key.string().map_or_else(String::new, |k| k.into_owned());
                out.edits.insert(key, Some(own_value(&item)));
            }
            Stored::Map(Box::new(out))
        }
    }
}

/// Turn an immutable child into its overlay form per the copy flags.
fn adopt_child(v: &Value<'_>, flags: CopyFlags) -> Stored {
    if flags.deep {
        match v.typed() {
            Typed::Array(_) => {
                return Stored::Array(Box::new(
                    MutableArray::from_value(v, flags).unwrap_or_default(),
                ))
            }
            Typed::Map(_) => {
                return Stored::Map(Box::new(
                    MutableMap::from_value(v, flags).unwrap_or_default(),
                ))
            }
            _ => {}
        }
    }
    if flags.copy_immutables {
        return own_value(v);
    }
    match SavedValue::capture(v) {
        Some(saved) => Stored::Saved(saved),
        None => own_value(v),
    }
}

/// A read-out of a mutable container slot.
#[derive(Debug, Clone, Copy)]
pub enum MutValue<'a> {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Str(&'a str),
    Data(&'a [u8]),
    /// An untouched immutable value.
    Value(Value<'a>),
    Array(&'a MutableArray),
    Map(&'a MutableMap),
}

impl<'a> MutValue<'a> {
    #[must_use]
    pub fn as_int(&self) -> i64 {
        match *self {
            MutValue::Bool(b) => i64::from(b),
            MutValue::Int(n) => n,
            MutValue::UInt(n) => n as i64,
            MutValue::Float(x) => x as i64,
            MutValue::Double(x) => x as i64,
            MutValue::Value(v) => v.as_int(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'a str {
        match *self {
            MutValue::Str(s) => s,
            MutValue::Value(v) => v.as_str(),
            _ => "",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, MutValue::Null) || matches!(self, MutValue::Value(v) if v.is_null())
    }
}

fn stored_view(stored: &Stored) -> MutValue<'_> {
    match stored {
        Stored::Inherited | Stored::Undefined => MutValue::Undefined,
        Stored::Null => MutValue::Null,
        Stored::Bool(b) => MutValue::Bool(*b),
        Stored::Int(n) => MutValue::Int(*n),
        Stored::UInt(n) => MutValue::UInt(*n),
        Stored::Float(x) => MutValue::Float(*x),
        Stored::Double(x) => MutValue::Double(*x),
        Stored::Str(s) => MutValue::Str(s),
        Stored::Data(b) => MutValue::Data(b),
        Stored::Saved(saved) => MutValue::Value(saved.value()),
        Stored::Array(a) => MutValue::Array(a),
        Stored::Map(m) => MutValue::Map(m),
    }
}

fn child_is_changed(stored: &Stored) -> bool {
    match stored {
        Stored::Array(a) => a.is_changed(),
        Stored::Map(m) => m.is_changed(),
        _ => false,
    }
}

/// A mutable array backed by an optional immutable source.
#[derive(Debug, Default)]
pub struct MutableArray {
    source: Option<SavedValue>,
    items: Vec<Stored>,
    changed: bool,
}

impl MutableArray {
    /// A new empty array with no source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A mutable copy of an immutable array. `None` if `v` is not an
    /// array. Default flags copy only this container, leaving children
    /// referenced in place.
    #[must_use]
    pub fn from_value(v: &Value<'_>, flags: CopyFlags) -> Option<Self> {
        let Typed::Array(arr) = v.typed() else {
            return None;
        };
        let source = SavedValue::capture(v);
        let items = if flags.deep || flags.copy_immutables || source.is_none() {
            arr.iter().map(|item| adopt_child(&item, flags)).collect()
        } else {
            (0..arr.count()).map(|_| Stored::Inherited).collect()
        };
        Some(Self {
            source,
            items,
            changed: false,
        })
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Read the slot at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<MutValue<'_>> {
        match self.items.get(index)? {
            Stored::Inherited => {
                let source = self.source.as_ref()?;
                source.value().as_array().get(index).map(MutValue::Value)
            }
            stored => Some(stored_view(stored)),
        }
    }

    /// Overwrite the slot at `index`.
    pub fn set(&mut self, index: usize, value: impl Into<SlotValue>) -> Result<()> {
        let len = self.items.len();
        let slot = self
            .items
            .get_mut(index)
            .ok_or(crate::error::Error::OutOfRange {
                offset: index as u32,
                len,
            })?;
        *slot = value.into().0;
        self.changed = true;
        Ok(())
    }

    /// Append a new slot.
    pub fn append(&mut self, value: impl Into<SlotValue>) {
        self.items.push(value.into().0);
        self.changed = true;
    }

    /// Insert `count` null slots at `index`, shifting the rest up.
    pub fn insert(&mut self, index: usize, count: usize) -> Result<()> {
        if index > self.items.len() {
            return Err(crate::error::Error::OutOfRange {
                offset: index as u32,
                len: self.items.len(),
            });
        }
        self.materialize();
        self.items
            .splice(index..index, (0..count).map(|_| Stored::Null));
        self.changed = true;
        Ok(())
    }

    /// Remove `count` slots starting at `index`.
    pub fn remove(&mut self, index: usize, count: usize) -> Result<()> {
        let end = index.checked_add(count).filter(|&e| e <= self.items.len());
        let Some(end) = end else {
            return Err(crate::error::Error::OutOfRange {
                offset: index as u32,
                len: self.items.len(),
            });
        };
        self.materialize();
        self.items.drain(index..end);
        self.changed = true;
        Ok(())
    }

    /// Remove every slot (the source is no longer consulted).
    pub fn remove_all(&mut self) {
        self.items.clear();
        self.changed = true;
    }

    /// Grow (with nulls) or shrink to `len` slots.
    pub fn resize(&mut self, len: usize) {
        if len < self.items.len() {
            self.materialize();
            self.items.truncate(len);
        } else {
            while self.items.len() < len {
                self.items.push(Stored::Null);
            }
        }
        self.changed = true;
    }

    /// Mutable view of the nested array at `index`, materializing a
    /// mutable copy if the slot currently holds an immutable array.
    /// `None` if the slot is not an array.
    pub fn get_array_mut(&mut self, index: usize) -> Option<&mut MutableArray> {
        self.materialize_container(index, false)?;
        match &mut self.items[index] {
            Stored::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Same as [`get_array_mut`](Self::get_array_mut), for maps.
    pub fn get_map_mut(&mut self, index: usize) -> Option<&mut MutableMap> {
        self.materialize_container(index, true)?;
        match &mut self.items[index] {
            Stored::Map(m) => Some(m),
            _ => None,
        }
    }

    fn materialize_container(&mut self, index: usize, map: bool) -> Option<()> {
        let current = self.items.get(index)?;
        let immutable = match current {
            Stored::Array(_) => return (!map).then_some(()),
            Stored::Map(_) => return map.then_some(()),
            Stored::Inherited => {
                let source = self.source.as_ref()?;
                source.value().as_array().get(index)?
            }
            Stored::Saved(saved) => saved.value(),
            _ => return None,
        };
        let replacement = if map {
            Stored::Map(Box::new(MutableMap::from_value(
                &immutable,
                CopyFlags::default(),
            )?))
        } else {
            Stored::Array(Box::new(MutableArray::from_value(
                &immutable,
                CopyFlags::default(),
            )?))
        };
        self.items[index] = replacement;
        self.changed = true;
        Some(())
    }

    /// Replace inherited slots with retained source values so structural
    /// edits keep index correspondence.
    fn materialize(&mut self) {
        let Some(source) = self.source.clone() else {
            return;
        };
        for (i, slot) in self.items.iter_mut().enumerate() {
            if matches!(slot, Stored::Inherited) {
                *slot = match source.value().as_array().get(i) {
                    Some(item) => SavedValue::capture(&item).map_or_else(
                        || own_value(&item),
                        Stored::Saved,
                    ),
                    None => Stored::Null,
                };
            }
        }
    }

    /// True iff any slot here or in a descendant mutable was overridden.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed || self.items.iter().any(child_is_changed)
    }

    /// The immutable array this one was copied from, if any.
    #[must_use]
    pub fn source(&self) -> Option<Value<'_>> {
        self.source.as_ref().map(SavedValue::value)
    }

    /// Write the union view through an encoder.
    pub fn encode_to(&self, enc: &mut Encoder) -> Result<()> {
        enc.begin_array(self.items.len())?;
        for (i, slot) in self.items.iter().enumerate() {
            if matches!(slot, Stored::Inherited) {
                match self.source.as_ref().and_then(|s| s.value().as_array().get(i)) {
                    Some(item) => enc.write_value(&item)?,
                    None => enc.write_null()?,
                }
            } else {
                encode_stored(enc, slot)?;
            }
        }
        enc.end_array()
    }
}

/// A mutable map backed by an optional immutable source.
#[derive(Debug, Default)]
pub struct MutableMap {
    source: Option<SavedValue>,
    /// Overrides by key; `None` marks a removal of a source key.
    edits: BTreeMap<String, Option<Stored>>,
    /// Set by `remove_all`: the source is no longer consulted.
    cleared: bool,
    changed: bool,
}

impl MutableMap {
    /// A new empty map with no source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A mutable copy of an immutable map. `None` if `v` is not a map.
    #[must_use]
    pub fn from_value(v: &Value<'_>, flags: CopyFlags) -> Option<Self> {
        let Typed::Map(map) = v.typed() else {
            return None;
        };
        let source = SavedValue::capture(v);
        let mut edits = BTreeMap::new();
        if flags.deep || flags.copy_immutables || source.is_none() {
            for (key, item) in map.iter() {
                let key = key.string().map_or_else(String::new, |k| k.into_owned());
                edits.insert(key, Some(adopt_child(&item, flags)));
            }
        }
        Some(Self {
            source,
            edits,
            cleared: false,
            changed: false,
        })
    }

    fn source_map(&self) -> Option<Value<'_>> {
        if self.cleared {
            return None;
        }
        self.source.as_ref().map(SavedValue::value)
    }

    /// Number of visible keys (source keys minus removals plus additions).
    #[must_use]
    pub fn count(&self) -> usize {
        self.keys().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sorted union of visible keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        if let Some(src) = self.source_map() {
            for (key, _) in src.as_map().iter() {
                if let Some(key) = key.string() {
                    if !self.edits.contains_key(key.as_ref()) {
                        keys.push(key.into_owned());
                    }
                }
            }
        }
        keys.extend(
            self.edits
                .iter()
                .filter_map(|(k, v)| v.as_ref().map(|_| k.clone())),
        );
        keys.sort();
        keys
    }

    /// Read the slot for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<MutValue<'_>> {
        match self.edits.get(key) {
            Some(Some(stored)) => Some(stored_view(stored)),
            Some(None) => None,
            None => self
                .source_map()?
                .as_map()
                .get(key)
                .map(MutValue::Value),
        }
    }

    /// Set the slot for `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<SlotValue>) {
        self.edits.insert(key.into(), Some(value.into().0));
        self.changed = true;
    }

    /// Remove `key` from the visible map.
    pub fn remove(&mut self, key: &str) {
        let in_source = self
            .source_map()
            .is_some_and(|src| src.as_map().get(key).is_some());
        if in_source {
            self.edits.insert(key.to_string(), None);
        } else {
            self.edits.remove(key);
        }
        self.changed = true;
    }

    /// Remove every key.
    pub fn remove_all(&mut self) {
        self.edits.clear();
        self.cleared = true;
        self.changed = true;
    }

    /// Mutable view of the nested map at `key`, materializing a mutable
    /// copy if the slot currently holds an immutable map.
    pub fn get_map_mut(&mut self, key: &str) -> Option<&mut MutableMap> {
        self.materialize_container(key, true)?;
        match self.edits.get_mut(key) {
            Some(Some(Stored::Map(m))) => Some(m),
            _ => None,
        }
    }

    /// Same as [`get_map_mut`](Self::get_map_mut), for arrays.
    pub fn get_array_mut(&mut self, key: &str) -> Option<&mut MutableArray> {
        self.materialize_container(key, false)?;
        match self.edits.get_mut(key) {
            Some(Some(Stored::Array(a))) => Some(a),
            _ => None,
        }
    }

    fn materialize_container(&mut self, key: &str, map: bool) -> Option<()> {
        let immutable = match self.edits.get(key) {
            Some(Some(Stored::Map(_))) => return map.then_some(()),
            Some(Some(Stored::Array(_))) => return (!map).then_some(()),
            Some(Some(Stored::Saved(saved))) => saved.value(),
            Some(_) => return None,
            None => self.source_map()?.as_map().get(key)?,
        };
        let replacement = if map {
            Stored::Map(Box::new(MutableMap::from_value(
                &immutable,
                CopyFlags::default(),
            )?))
        } else {
            Stored::Array(Box::new(MutableArray::from_value(
                &immutable,
                CopyFlags::default(),
            )?))
        };
        self.edits.insert(key.to_string(), Some(replacement));
        self.changed = true;
        Some(())
    }

    /// True iff any key here or in a descendant mutable was overridden.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.changed || self.edits.values().flatten().any(child_is_changed)
    }

    /// The immutable map this one was copied from, if any.
    #[must_use]
    pub fn source(&self) -> Option<Value<'_>> {
        self.source.as_ref().map(SavedValue::value)
    }

    /// Write the union view through an encoder.
    pub fn encode_to(&self, enc: &mut Encoder) -> Result<()> {
        let keys = self.keys();
        enc.begin_map(keys.len())?;
        for key in &keys {
            enc.write_key(key)?;
            match self.edits.get(key) {
                Some(Some(stored)) => encode_stored(enc, stored)?,
                _ => match self.source_map().and_then(|src| src.as_map().get(key)) {
                    Some(item) => enc.write_value(&item)?,
                    None => enc.write_null()?,
                },
            }
        }
        enc.end_map()
    }
}

/// Encode one overlay slot. Inherited slots are resolved by the container
/// before reaching here.
fn encode_stored(enc: &mut Encoder, stored: &Stored) -> Result<()> {
    match stored {
        Stored::Inherited | Stored::Undefined => enc.write_undefined(),
        Stored::Null => enc.write_null(),
        Stored::Bool(b) => enc.write_bool(*b),
        Stored::Int(n) => enc.write_int(*n),
        Stored::UInt(n) => enc.write_uint(*n),
        Stored::Float(x) => enc.write_float(*x),
        Stored::Double(x) => enc.write_double(*x),
        Stored::Str(s) => enc.write_str(s),
        Stored::Data(b) => enc.write_data(b),
        Stored::Saved(saved) => enc.write_value(&saved.value()),
        Stored::Array(a) => a.encode_to(enc),
        Stored::Map(m) => m.encode_to(enc),
    }
}

impl Encoder {
    /// Write a mutable array's union view as a value.
    pub fn write_mutable_array(&mut self, array: &MutableArray) -> Result<()> {
        array.encode_to(self)
    }

    /// Write a mutable map's union view as a value.
    pub fn write_mutable_map(&mut self, map: &MutableMap) -> Result<()> {
        map.encode_to(self)
    }
}
