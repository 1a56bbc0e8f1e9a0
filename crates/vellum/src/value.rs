//! Zero-copy value views over encoded vellum data.
//!
//! A [`Value`] is a position inside an immutable byte range. It stores no
//! parsed state; accessors decode the underlying bytes on demand. Values are
//! `Copy` and are valid for as long as the byte range they borrow from.
//!
//! # `Typed` access
//!
//! Use [`Value::typed()`] for pattern matching:
//!
//! ```
//! use vellum::{Typed, Value};
//!
//! let data = [0x00, 0x2A, 0x80, 0x01]; // short int 42 + trailer
//! let value = Value::from_data(&data).unwrap();
//!
//! match value.typed() {
//!     Typed::Int(n) => assert_eq!(n, 42),
//!     _ => panic!("expected int"),
//! }
//! ```

use crate::array::Array;
use crate::map::Map;
use crate::scope;
use crate::tag::{
    self, Header, Tag, CONTAINER_COUNT_ESCAPE, INLINE_LEN_ESCAPE, SPECIAL_FALSE, SPECIAL_NULL,
    SPECIAL_TRUE,
};

/// Maximum container nesting accepted by validation, equality, and the JSON
/// writer. Documents deeper than this are rejected rather than recursed into.
pub const MAX_DEPTH: usize = 100;

/// Pointer chains (trailer -> wide root pointer) are at most this long.
const MAX_POINTER_HOPS: usize = 3;

static UNDEFINED_CELL: [u8; 2] = [0x3C, 0x00];
static NULL_CELL: [u8; 2] = [0x30, 0x00];
static EMPTY_ARRAY_CELL: [u8; 2] = [0x60, 0x00];
static EMPTY_MAP_CELL: [u8; 2] = [0x70, 0x00];

/// Logical type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Undefined,
    Null,
    Bool,
    Int,
    UInt,
    Float,
    Double,
    Str,
    Data,
    Array,
    Map,
}

/// A typed view of a value for pattern matching.
#[derive(Debug, Clone)]
pub enum Typed<'a> {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Str(&'a str),
    Data(&'a [u8]),
    Array(Array<'a>),
    Map(Map<'a>),
}

/// A zero-copy view into an encoded value at a specific offset.
#[derive(Clone, Copy)]
pub struct Value<'a> {
    /// The owning scope's byte range.
    data: &'a [u8],
    /// Offset of this value's header within `data`. Always even.
    offset: u32,
}

impl<'a> Value<'a> {
    /// Find the root of an untrusted document, validating the whole tree.
    ///
    /// Returns `None` if the buffer has no trailer, the trailer does not
    /// lead to a value, or any reachable cell is malformed.
    #[must_use]
    pub fn from_data(data: &'a [u8]) -> Option<Self> {
        Self::from_data_extern(data, 0)
    }

    /// Like [`Value::from_data`] but permitting pointers that reach up to
    /// `extern_len` bytes before the start of `data` (an extern range).
    #[must_use]
    pub(crate) fn from_data_extern(data: &'a [u8], extern_len: usize) -> Option<Self> {
        let root = Self::root_from_trailer(data)?;
        validate_value(data, root.offset as usize, extern_len, 0)?;
        Some(root)
    }

    /// Find the root of a trusted document. Only the trailer is read; no
    /// validation is performed, and malformed input yields nonsense values.
    #[must_use]
    pub fn from_trusted_data(data: &'a [u8]) -> Option<Self> {
        Self::root_from_trailer(data)
    }

    fn root_from_trailer(data: &'a [u8]) -> Option<Self> {
        if data.len() < 4 || data.len() % 2 != 0 {
            return None;
        }
        let trailer = (data.len() - 2) as u32;
        if !Header::read(data, trailer as usize)?.is_pointer() {
            return None;
        }
        deref_pointer(data, trailer, false)
    }

    /// View a value at a known offset. The caller must know that `offset`
    /// is the first byte of a value header.
    #[must_use]
    pub(crate) fn at(data: &'a [u8], offset: u32) -> Option<Self> {
        if offset as usize + 2 > data.len() || offset % 2 != 0 {
            return None;
        }
        Some(Self { data, offset })
    }

    /// The canonical undefined value.
    #[must_use]
    pub fn undefined() -> Value<'static> {
        Value { data: &UNDEFINED_CELL, offset: 0 }
    }

    /// The canonical null value.
    #[must_use]
    pub fn null() -> Value<'static> {
        Value { data: &NULL_CELL, offset: 0 }
    }

    /// The canonical empty array. All empty-array coercions return views of
    /// this same cell, so data-pointer identity comparisons work.
    #[must_use]
    pub fn empty_array() -> Value<'static> {
        Value { data: &EMPTY_ARRAY_CELL, offset: 0 }
    }

    /// The canonical empty map.
    #[must_use]
    pub fn empty_map() -> Value<'static> {
        Value { data: &EMPTY_MAP_CELL, offset: 0 }
    }

    /// The byte range this value lives in.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Offset of this value's header within its byte range.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Raw address of this value's first byte, as used by the scope registry.
    #[inline]
    #[must_use]
    pub(crate) fn address(&self) -> usize {
        self.data.as_ptr() as usize + self.offset as usize
    }

    #[inline]
    pub(crate) fn header(&self) -> Header {
        Header(
            self.data[self.offset as usize],
            *self.data.get(self.offset as usize + 1).unwrap_or(&0),
        )
    }

    /// The logical type of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        let h = self.header();
        match h.tag() {
            Tag::ShortInt => ValueType::Int,
            Tag::Int => {
                if h.int_is_unsigned() {
                    ValueType::UInt
                } else {
                    ValueType::Int
                }
            }
            Tag::Float => {
                if h.float_is_double() {
                    ValueType::Double
                } else {
                    ValueType::Float
                }
            }
            Tag::Special => match h.special() {
                SPECIAL_NULL => ValueType::Null,
                SPECIAL_FALSE | SPECIAL_TRUE => ValueType::Bool,
                _ => ValueType::Undefined,
            },
            Tag::Str => ValueType::Str,
            Tag::Data => ValueType::Data,
            Tag::Array => ValueType::Array,
            Tag::Map => ValueType::Map,
            // A bare pointer is not a value; treat as undefined.
            Tag::Pointer => ValueType::Undefined,
        }
    }

    /// Get a typed view for pattern matching. Malformed payloads (possible
    /// only with trusted decoding of bad input) surface as `Undefined`.
    #[must_use]
    pub fn typed(&self) -> Typed<'a> {
        let h = self.header();
        match h.tag() {
            Tag::ShortInt => Typed::Int(h.short_int()),
            Tag::Int => match self.read_int() {
                Some((n, true)) => Typed::UInt(n),
                Some((n, false)) => Typed::Int(n as i64),
                None => Typed::Undefined,
            },
            Tag::Float => {
                if h.float_is_double() {
                    match self.read_f64() {
                        Some(f) => Typed::Double(f),
                        None => Typed::Undefined,
                    }
                } else {
                    match self.read_f32() {
                        Some(f) => Typed::Float(f),
                        None => Typed::Undefined,
                    }
                }
            }
            Tag::Special => match h.special() {
                SPECIAL_NULL => Typed::Null,
                SPECIAL_FALSE => Typed::Bool(false),
                SPECIAL_TRUE => Typed::Bool(true),
                _ => Typed::Undefined,
            },
            Tag::Str => match self.str_or_data_bytes() {
                Some(b) => match std::str::from_utf8(b) {
                    Ok(s) => Typed::Str(s),
                    Err(_) => Typed::Undefined,
                },
                None => Typed::Undefined,
            },
            Tag::Data => match self.str_or_data_bytes() {
                Some(b) => Typed::Data(b),
                None => Typed::Undefined,
            },
            Tag::Array => Typed::Array(Array::new(*self)),
            Tag::Map => Typed::Map(Map::new(*self)),
            Tag::Pointer => Typed::Undefined,
        }
    }

    // --- Type predicates ---

    #[inline]
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        self.value_type() == ValueType::Undefined
    }

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.value_type() == ValueType::Null
    }

    /// Is this an integer (signed or unsigned)?
    #[inline]
    #[must_use]
    pub fn is_integer(&self) -> bool {
        matches!(self.value_type(), ValueType::Int | ValueType::UInt)
    }

    /// Is this any numeric type?
    #[inline]
    #[must_use]
    pub fn is_number(&self) -> bool {
        matches!(
            self.value_type(),
            ValueType::Int | ValueType::UInt | ValueType::Float | ValueType::Double
        )
    }

    // --- Payload readers ---

    /// Out-of-line int payload. Returns (two's-complement bits, unsigned flag).
    fn read_int(&self) -> Option<(u64, bool)> {
        let h = self.header();
        let n = h.int_size();
        let start = self.offset as usize + 1;
        let bytes = self.data.get(start..start + n)?;
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(bytes);
        let mut raw = u64::from_le_bytes(buf);
        // Sign-extend signed ints shorter than 8 bytes.
        if !h.int_is_unsigned() && n < 8 && bytes[n - 1] & 0x80 != 0 {
            raw |= !0u64 << (n * 8);
        }
        Some((raw, h.int_is_unsigned()))
    }

    fn read_f32(&self) -> Option<f32> {
        let start = self.offset as usize + 2;
        let bytes: [u8; 4] = self.data.get(start..start + 4)?.try_into().ok()?;
        Some(f32::from_le_bytes(bytes))
    }

    fn read_f64(&self) -> Option<f64> {
        let start = self.offset as usize + 2;
        let bytes: [u8; 8] = self.data.get(start..start + 8)?.try_into().ok()?;
        Some(f64::from_le_bytes(bytes))
    }

    fn str_or_data_bytes(&self) -> Option<&'a [u8]> {
        let h = self.header();
        let base = self.offset as usize;
        let inline = h.inline_len();
        if inline < INLINE_LEN_ESCAPE {
            self.data.get(base + 1..base + 1 + inline as usize)
        } else {
            let (len, vlen) = tag::read_varint(self.data, base + 1)?;
            let start = base + 1 + vlen;
            self.data.get(start..start.checked_add(usize::try_from(len).ok()?)?)
        }
    }

    // --- Coercions (sentinel-returning, per the boundary contract) ---

    /// Coerce to a signed integer. Floats truncate toward zero; booleans
    /// become 0/1; strings, blobs, and containers become 0.
    #[must_use]
    pub fn as_int(&self) -> i64 {
        match self.typed() {
            Typed::Int(n) => n,
            Typed::UInt(n) => n as i64,
            Typed::Float(f) => f as i64,
            Typed::Double(f) => f as i64,
            Typed::Bool(b) => i64::from(b),
            _ => 0,
        }
    }

    /// Coerce to an unsigned integer. Negative ints yield their
    /// two's-complement reinterpretation.
    #[must_use]
    pub fn as_uint(&self) -> u64 {
        match self.typed() {
            Typed::Int(n) => n as u64,
            Typed::UInt(n) => n,
            Typed::Float(f) => f as u64,
            Typed::Double(f) => f as u64,
            Typed::Bool(b) => u64::from(b),
            _ => 0,
        }
    }

    /// Coerce to a single-precision float.
    #[must_use]
    pub fn as_float(&self) -> f32 {
        self.as_double() as f32
    }

    /// Coerce to a double-precision float.
    #[must_use]
    pub fn as_double(&self) -> f64 {
        match self.typed() {
            Typed::Int(n) => n as f64,
            Typed::UInt(n) => n as f64,
            Typed::Float(f) => f64::from(f),
            Typed::Double(f) => f,
            Typed::Bool(b) => f64::from(u8::from(b)),
            _ => 0.0,
        }
    }

    /// Coerce to a boolean: false for undefined, null, false, and numeric
    /// zero; true otherwise.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self.typed() {
            Typed::Undefined | Typed::Null => false,
            Typed::Bool(b) => b,
            Typed::Int(n) => n != 0,
            Typed::UInt(n) => n != 0,
            Typed::Float(f) => f != 0.0,
            Typed::Double(f) => f != 0.0,
            _ => true,
        }
    }

    /// String content, or `""` if this is not a string.
    #[must_use]
    pub fn as_str(&self) -> &'a str {
        match self.typed() {
            Typed::Str(s) => s,
            _ => "",
        }
    }

    /// Blob or string bytes, or an empty slice for other types.
    #[must_use]
    pub fn as_data(&self) -> &'a [u8] {
        match self.typed() {
            Typed::Data(b) => b,
            Typed::Str(s) => s.as_bytes(),
            _ => &[],
        }
    }

    /// Interpret as a timestamp in milliseconds since the Unix epoch.
    ///
    /// Integers pass through; strings parse as ISO-8601; anything else is
    /// `None`.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<i64> {
        match self.typed() {
            Typed::Int(n) => Some(n),
            Typed::UInt(n) => i64::try_from(n).ok(),
            Typed::Str(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis()),
            _ => None,
        }
    }

    /// Coerce to an array view; non-arrays yield the canonical empty array.
    #[must_use]
    pub fn as_array(&self) -> Array<'a> {
        match self.typed() {
            Typed::Array(a) => a,
            _ => Array::new(Value::empty_array()),
        }
    }

    /// Coerce to a map view; non-maps yield the canonical empty map.
    #[must_use]
    pub fn as_map(&self) -> Map<'a> {
        match self.typed() {
            Typed::Map(m) => m,
            _ => Map::new(Value::empty_map()),
        }
    }

    /// Total encoded size of this cell in bytes (without trailing padding).
    /// For containers this spans the header through the last slot.
    #[must_use]
    pub(crate) fn cell_size(&self) -> Option<usize> {
        let h = self.header();
        let base = self.offset as usize;
        match h.tag() {
            Tag::ShortInt | Tag::Special | Tag::Pointer => Some(2),
            Tag::Int => Some(1 + h.int_size()),
            Tag::Float => Some(2 + if h.float_is_double() { 8 } else { 4 }),
            Tag::Str | Tag::Data => {
                let inline = h.inline_len();
                if inline < INLINE_LEN_ESCAPE {
                    Some(1 + inline as usize)
                } else {
                    let (len, vlen) = tag::read_varint(self.data, base + 1)?;
                    Some(1 + vlen + usize::try_from(len).ok()?)
                }
            }
            Tag::Array | Tag::Map => {
                let info = container_info(self.data, self.offset)?;
                Some(info.first_slot as usize - base + info.slots * info.width)
            }
        }
    }

    /// Deep structural equality. Undefined and null are distinct; numbers
    /// compare by mathematical value across int and float encodings.
    #[must_use]
    pub fn is_equal(&self, other: &Value<'_>) -> bool {
        is_equal_at(self, other, 0)
    }
}

impl std::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.typed() {
            Typed::Undefined => write!(f, "Value::Undefined"),
            Typed::Null => write!(f, "Value::Null"),
            Typed::Bool(b) => write!(f, "Value::Bool({b:?})"),
            Typed::Int(n) => write!(f, "Value::Int({n:?})"),
            Typed::UInt(n) => write!(f, "Value::UInt({n:?})"),
            Typed::Float(x) => write!(f, "Value::Float({x:?})"),
            Typed::Double(x) => write!(f, "Value::Double({x:?})"),
            Typed::Str(s) => write!(f, "Value::Str({s:?})"),
            Typed::Data(b) => write!(f, "Value::Data({b:?})"),
            Typed::Array(_) => write!(f, "Value::Array(@{:#x})", self.offset),
            Typed::Map(_) => write!(f, "Value::Map(@{:#x})", self.offset),
        }
    }
}

impl std::fmt::Display for Value<'_> {
    /// Canonical text form: JSON literals for scalars, JSON for containers.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match crate::json::to_json(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("?"),
        }
    }
}

fn is_equal_at(a: &Value<'_>, b: &Value<'_>, depth: usize) -> bool {
    if depth > MAX_DEPTH {
        return false;
    }
    if a.address() == b.address() {
        return true;
    }
    match (a.typed(), b.typed()) {
        (Typed::Undefined, Typed::Undefined) | (Typed::Null, Typed::Null) => true,
        (Typed::Bool(x), Typed::Bool(y)) => x == y,
        (Typed::Str(x), Typed::Str(y)) => x == y,
        (Typed::Data(x), Typed::Data(y)) => x == y,
        (Typed::Array(x), Typed::Array(y)) => {
            x.count() == y.count()
                && x.iter()
                    .zip(y.iter())
                    .all(|(va, vb)| is_equal_at(&va, &vb, depth + 1))
        }
        // Keys are matched by lookup, not position: two tables can assign
        // shared-key codes in different orders, so slot order may differ
        // between structurally equal maps.
        (Typed::Map(x), Typed::Map(y)) => {
            x.count() == y.count()
                && x.iter().all(|(key, va)| {
                    let vb = match key.string() {
                        Some(s) => y.get(&s),
                        None => key.code().and_then(|c| y.get_by_code(c)),
                    };
                    vb.is_some_and(|vb| is_equal_at(&va, &vb, depth + 1))
                })
        }
        (ta, tb) => numeric_equal(&ta, &tb).unwrap_or(false),
    }
}

/// Cross-representation numeric equality. `None` if either side is not a
/// number.
fn numeric_equal(a: &Typed<'_>, b: &Typed<'_>) -> Option<bool> {
    #[derive(Clone, Copy)]
    enum Num {
        I(i64),
        U(u64),
        F(f64),
    }
    fn num(t: &Typed<'_>) -> Option<Num> {
        match *t {
            Typed::Int(n) => Some(Num::I(n)),
            Typed::UInt(n) => Some(Num::U(n)),
            Typed::Float(f) => Some(Num::F(f64::from(f))),
            Typed::Double(f) => Some(Num::F(f)),
            _ => None,
        }
    }
    let result = match (num(a)?, num(b)?) {
        (Num::I(x), Num::I(y)) => x == y,
        (Num::U(x), Num::U(y)) => x == y,
        (Num::I(x), Num::U(y)) | (Num::U(y), Num::I(x)) => x >= 0 && x as u64 == y,
        (Num::F(x), Num::F(y)) => x == y,
        (Num::I(x), Num::F(y)) | (Num::F(y), Num::I(x)) => x as f64 == y,
        (Num::U(x), Num::F(y)) | (Num::F(y), Num::U(x)) => x as f64 == y,
    };
    Some(result)
}

/// Resolved layout of a container at `offset`.
#[derive(Clone, Copy)]
pub(crate) struct ContainerInfo {
    /// Number of slots (array: element count; map: 2 x pair count).
    pub slots: usize,
    /// Element count (array) or pair count (map).
    pub count: usize,
    /// Bytes per slot: 2 or 4.
    pub width: usize,
    /// Offset of the first slot.
    pub first_slot: u32,
}

pub(crate) fn container_info(data: &[u8], offset: u32) -> Option<ContainerInfo> {
    let h = Header::read(data, offset as usize)?;
    let is_map = h.tag() == Tag::Map;
    let width = if h.container_is_wide() { 4 } else { 2 };
    let inline_count = h.container_count();
    let (count, after_header) = if inline_count == CONTAINER_COUNT_ESCAPE {
        let (n, vlen) = tag::read_varint(data, offset as usize + 2)?;
        (
            usize::try_from(n).ok()?,
            offset as usize + 2 + tag::align2(vlen),
        )
    } else {
        (inline_count as usize, offset as usize + 2)
    };
    let slots = if is_map { count.checked_mul(2)? } else { count };
    Some(ContainerInfo {
        slots,
        count,
        width,
        first_slot: u32::try_from(after_header).ok()?,
    })
}

/// Read the slot at `slot_offset`, following a pointer if present.
///
/// `wide` selects the pointer form the container width implies.
pub(crate) fn deref_slot(data: &[u8], slot_offset: u32, wide: bool) -> Option<Value<'_>> {
    let h = Header::read(data, slot_offset as usize)?;
    if h.is_pointer() {
        deref_pointer(data, slot_offset, wide)
    } else {
        Value::at(data, slot_offset)
    }
}

/// Follow a pointer cell at `offset`, chasing at most [`MAX_POINTER_HOPS`]
/// chained pointers (a pointer's target read as wide, per the trailer rule).
pub(crate) fn deref_pointer(data: &[u8], offset: u32, mut wide: bool) -> Option<Value<'_>> {
    let mut at = offset;
    for _ in 0..MAX_POINTER_HOPS {
        let units = if wide {
            let slot: [u8; 4] = data.get(at as usize..at as usize + 4)?.try_into().ok()?;
            tag::wide_offset(slot)
        } else {
            Header::read(data, at as usize)?.narrow_offset()
        };
        if units == 0 {
            return None;
        }
        let back = (units as usize).checked_mul(2)?;
        let target = match (at as usize).checked_sub(back) {
            Some(t) => t,
            // Reaches before the range: an extern pointer.
            None => return scope::resolve_extern(data, back - at as usize),
        };
        let value = Value::at(data, target as u32)?;
        if !value.header().is_pointer() {
            return Some(value);
        }
        // A pointer reached through a pointer is wide.
        at = target as u32;
        wide = true;
    }
    None
}

/// Validate one value (recursively for containers) in an untrusted buffer.
/// `extern_len` extends the addressable range that many bytes before the
/// buffer start; extern targets themselves are not walked here (they were
/// validated when their own document was opened).
fn validate_value(data: &[u8], offset: usize, extern_len: usize, depth: usize) -> Option<()> {
    if depth > MAX_DEPTH || offset % 2 != 0 {
        return None;
    }
    let v = Value::at(data, u32::try_from(offset).ok()?)?;
    let h = v.header();
    match h.tag() {
        Tag::ShortInt | Tag::Special => Some(()),
        Tag::Int => {
            v.read_int()?;
            Some(())
        }
        Tag::Float => {
            if h.float_is_double() {
                v.read_f64()?;
            } else {
                v.read_f32()?;
            }
            Some(())
        }
        Tag::Str => {
            std::str::from_utf8(v.str_or_data_bytes()?).ok()?;
            Some(())
        }
        Tag::Data => {
            v.str_or_data_bytes()?;
            Some(())
        }
        Tag::Array | Tag::Map => {
            let info = container_info(data, v.offset)?;
            let end = info.first_slot as usize + info.slots.checked_mul(info.width)?;
            if end > data.len() {
                return None;
            }
            for i in 0..info.slots {
                let slot = info.first_slot as usize + i * info.width;
                let sh = Header::read(data, slot)?;
                if sh.is_pointer() {
                    let units = if info.width == 4 {
                        let raw: [u8; 4] = data.get(slot..slot + 4)?.try_into().ok()?;
                        tag::wide_offset(raw)
                    } else {
                        sh.narrow_offset()
                    };
                    if units == 0 {
                        return None;
                    }
                    let back = (units as usize).checked_mul(2)?;
                    match slot.checked_sub(back) {
                        Some(target) => validate_value(data, target, extern_len, depth + 1)?,
                        None => {
                            // Extern pointer: only the reach is checked.
                            if back - slot > extern_len {
                                return None;
                            }
                        }
                    }
                } else {
                    let inline = Value::at(data, slot as u32)?;
                    if inline.cell_size()? > info.width {
                        return None;
                    }
                    validate_value(data, slot, extern_len, depth + 1)?;
                }
            }
            Some(())
        }
        Tag::Pointer => None,
    }
}
