//! Streaming encoder producing vellum-encoded byte buffers.
//!
//! The encoder assembles values into a growing buffer. Scalars that fit a
//! 2-byte cell stay inline in their container slot; everything else is
//! written out-of-line immediately and referenced by a back-pointer when
//! its container closes. On `end_array`/`end_map` the buffered slots are
//! measured to pick the slot width (2 or 4 bytes), map slots are sorted by
//! key, and the container is emitted; the container then becomes a slot of
//! its parent. `finish` appends the trailer pointer to the last-written
//! top-level value.
//!
//! Errors are sticky: after the first failure every subsequent write is a
//! no-op reporting [`Error::EncoderFailed`], and `finish` surfaces the
//! original error.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::map::MapKey;
use crate::scope::{Doc, Trust};
use crate::shared_keys::SharedKeys;
use crate::tag::{
    self, encode_container_header, encode_float_header, encode_int_header, encode_narrow_pointer,
    encode_short_int, encode_special, encode_str_header, encode_wide_pointer, CONTAINER_COUNT_ESCAPE,
    INLINE_LEN_ESCAPE, NARROW_POINTER_MAX, SPECIAL_FALSE, SPECIAL_NULL, SPECIAL_TRUE,
    SPECIAL_UNDEFINED,
};
use crate::value::{Typed, Value, MAX_DEPTH};

/// Encoder construction options.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Initial buffer capacity in bytes.
    pub reserve_size: usize,
    /// Deduplicate repeated strings via back-pointers.
    pub unique_strings: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            reserve_size: 256,
            unique_strings: true,
        }
    }
}

/// A buffered container slot: either a complete 2-byte cell or a reference
/// to an out-of-line value by its logical address.
#[derive(Clone, Copy)]
enum Slot {
    Inline([u8; 2]),
    Ref(u32),
}

struct Pending {
    map: bool,
    slots: Vec<Slot>,
    /// Map state machine: the next write must be a key.
    expecting_key: bool,
}

/// Streaming vellum encoder.
pub struct Encoder {
    out: Vec<u8>,
    /// Base document for amendment; logical addresses of `out` start after
    /// it.
    base: Option<Arc<[u8]>>,
    base_len: usize,
    extern_pointers: bool,
    /// String content -> logical address of the first copy.
    strings: FxHashMap<Box<[u8]>, u32>,
    /// Open containers; index 0 is the synthetic top level.
    stack: Vec<Pending>,
    shared_keys: Option<Arc<SharedKeys>>,
    options: EncoderOptions,
    suppress_trailer: bool,
    error: Option<Error>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(EncoderOptions::default())
    }

    #[must_use]
    pub fn with_options(options: EncoderOptions) -> Self {
        Self {
            out: Vec::with_capacity(options.reserve_size),
            base: None,
            base_len: 0,
            extern_pointers: false,
            strings: FxHashMap::default(),
            stack: vec![Pending {
                map: false,
                slots: Vec::new(),
                expecting_key: false,
            }],
            shared_keys: None,
            options,
            suppress_trailer: false,
            error: None,
        }
    }

    /// Attach a shared-key table; eligible string keys written afterwards
    /// are interned through it.
    pub fn set_shared_keys(&mut self, keys: Arc<SharedKeys>) {
        self.shared_keys = Some(keys);
    }

    /// Skip the trailer on `finish`. The caller must then remember the
    /// root offset out of band.
    pub fn suppress_trailer(&mut self) {
        self.suppress_trailer = true;
    }

    /// Make this encoder append an amendment to `base`: output addresses
    /// start after the base and pointers may reach back into it. With
    /// `extern_pointers` the finished fragment is meant to be opened with
    /// the base as its extern destination; without, it is meant to be
    /// concatenated after the base.
    pub fn set_base(&mut self, base: Arc<[u8]>, extern_pointers: bool) -> Result<()> {
        self.guard()?;
        if !self.out.is_empty() || self.stack.len() > 1 || !self.stack[0].slots.is_empty() {
            return self.fail(Error::Encode("set_base after writing".into()));
        }
        if base.len() % 2 != 0 {
            return self.fail(Error::Encode("base length must be even".into()));
        }
        self.base_len = base.len();
        self.base = Some(base);
        self.extern_pointers = extern_pointers;
        Ok(())
    }

    /// Load the base document's strings (values and map keys) into the
    /// uniquing table so new writes back-reference them instead of
    /// re-embedding.
    pub fn reuse_base_strings(&mut self) -> Result<()> {
        self.guard()?;
        let Some(base) = self.base.clone() else {
            return self.fail(Error::Encode("reuse_base_strings without a base".into()));
        };
        let Some(root) = Value::from_trusted_data(&base) else {
            return self.fail(Error::Encode("base has no root".into()));
        };
        let mut stack: Vec<Value<'_>> = vec![root];
        while let Some(v) = stack.pop() {
            match v.typed() {
                Typed::Str(s) => {
                    if s.len() >= 2 {
                        self.strings.entry(s.as_bytes().into()).or_insert(v.offset());
                    }
                }
                Typed::Array(arr) => stack.extend(arr.iter()),
                Typed::Map(map) => {
                    for pair in 0..map.count() {
                        if let Some(key) = map.key_cell(pair) {
                            stack.push(key);
                        }
                    }
                    stack.extend(map.iter().map(|(_, item)| item));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Bytes produced so far (excluding any base).
    #[must_use]
    pub fn bytes_written(&self) -> usize {
        self.out.len()
    }

    /// The first error this encoder hit, if any.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Clear all state (except options) so the encoder can be reused.
    pub fn reset(&mut self) {
        self.out.clear();
        self.base = None;
        self.base_len = 0;
        self.extern_pointers = false;
        self.strings.clear();
        self.stack.clear();
        self.stack.push(Pending {
            map: false,
            slots: Vec::new(),
            expecting_key: false,
        });
        self.error = None;
        self.suppress_trailer = false;
    }

    // --- Internal plumbing ---

    fn guard(&self) -> Result<()> {
        match &self.error {
            Some(_) => Err(Error::EncoderFailed),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: Error) -> Result<()> {
        if self.error.is_none() {
            self.error = Some(e.clone());
        }
        Err(e)
    }

    /// Logical address of the next byte written.
    fn here(&self) -> u32 {
        (self.base_len + self.out.len()) as u32
    }

    fn align(&mut self) {
        if (self.base_len + self.out.len()) % 2 != 0 {
            self.out.push(0);
        }
    }

    /// Append a value slot to the innermost open container, enforcing the
    /// map key/value alternation.
    fn push_slot(&mut self, slot: Slot) -> Result<()> {
        let top = self.stack.last_mut().expect("stack bottom always present");
        if top.map {
            if top.expecting_key {
                return self.fail(Error::Encode("expected a key before this value".into()));
            }
            top.expecting_key = true;
        }
        top.slots.push(slot);
        Ok(())
    }

    fn push_key_slot(&mut self, slot: Slot) -> Result<()> {
        let top = self.stack.last_mut().expect("stack bottom always present");
        if !top.map {
            return self.fail(Error::Encode("write_key outside a map".into()));
        }
        if !top.expecting_key {
            return self.fail(Error::Encode("key written twice".into()));
        }
        top.expecting_key = false;
        top.slots.push(slot);
        Ok(())
    }

    /// Write an out-of-line string/blob cell, returning its address.
    fn emit_str_like(&mut self, tag_nibble: u8, bytes: &[u8]) -> u32 {
        self.align();
        let addr = self.here();
        if bytes.len() < INLINE_LEN_ESCAPE as usize {
            self.out
                .push(encode_str_header(tag_nibble, bytes.len() as u8));
        } else {
            self.out
                .push(encode_str_header(tag_nibble, INLINE_LEN_ESCAPE));
            tag::write_varint(&mut self.out, bytes.len() as u64);
        }
        self.out.extend_from_slice(bytes);
        addr
    }

    fn str_slot(&mut self, bytes: &[u8], unique: bool) -> Slot {
        match bytes.len() {
            0 => Slot::Inline([0x40, 0x00]),
            1 => Slot::Inline([0x41, bytes[0]]),
            _ => {
                if unique && self.options.unique_strings {
                    if let Some(&addr) = self.strings.get(bytes) {
                        return Slot::Ref(addr);
                    }
                }
                let addr = self.emit_str_like(0x4, bytes);
                if unique && self.options.unique_strings {
                    self.strings.insert(bytes.into(), addr);
                }
                Slot::Ref(addr)
            }
        }
    }

    // --- Scalar writers ---

    pub fn write_null(&mut self) -> Result<()> {
        self.guard()?;
        self.push_slot(Slot::Inline(encode_special(SPECIAL_NULL)))
    }

    pub fn write_undefined(&mut self) -> Result<()> {
        self.guard()?;
        self.push_slot(Slot::Inline(encode_special(SPECIAL_UNDEFINED)))
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.guard()?;
        let sub = if value { SPECIAL_TRUE } else { SPECIAL_FALSE };
        self.push_slot(Slot::Inline(encode_special(sub)))
    }

    pub fn write_int(&mut self, value: i64) -> Result<()> {
        self.guard()?;
        let slot = if (-2048..=2047).contains(&value) {
            Slot::Inline(encode_short_int(value as i16))
        } else {
            let n = signed_byte_count(value);
            self.align();
            let addr = self.here();
            self.out.push(encode_int_header(n, false));
            self.out.extend_from_slice(&value.to_le_bytes()[..n]);
            Slot::Ref(addr)
        };
        self.push_slot(slot)
    }

    pub fn write_uint(&mut self, value: u64) -> Result<()> {
        self.guard()?;
        // The unsigned flag is only needed past i64::MAX; smaller values
        // keep the signed form so readers see plain ints.
        if let Ok(v) = i64::try_from(value) {
            return self.write_int(v);
        }
        let n = unsigned_byte_count(value);
        self.align();
        let addr = self.here();
        self.out.push(encode_int_header(n, true));
        self.out.extend_from_slice(&value.to_le_bytes()[..n]);
        self.push_slot(Slot::Ref(addr))
    }

    pub fn write_float(&mut self, value: f32) -> Result<()> {
        self.guard()?;
        self.align();
        let addr = self.here();
        self.out.extend_from_slice(&encode_float_header(false));
        self.out.extend_from_slice(&value.to_le_bytes());
        self.push_slot(Slot::Ref(addr))
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.guard()?;
        // Narrow to a 4-byte float when lossless.
        #[allow(clippy::float_cmp)]
        if f64::from(value as f32) == value {
            return self.write_float(value as f32);
        }
        self.align();
        let addr = self.here();
        self.out.extend_from_slice(&encode_float_header(true));
        self.out.extend_from_slice(&value.to_le_bytes());
        self.push_slot(Slot::Ref(addr))
    }

    pub fn write_str(&mut self, value: &str) -> Result<()> {
        self.guard()?;
        let slot = self.str_slot(value.as_bytes(), true);
        self.push_slot(slot)
    }

    pub fn write_data(&mut self, value: &[u8]) -> Result<()> {
        self.guard()?;
        let slot = match value.len() {
            0 => Slot::Inline([0x50, 0x00]),
            1 => Slot::Inline([0x51, value[0]]),
            _ => Slot::Ref(self.emit_str_like(0x5, value)),
        };
        self.push_slot(slot)
    }

    /// Write a timestamp as an ISO-8601 string.
    pub fn write_date(&mut self, millis: i64, utc: bool) -> Result<()> {
        self.guard()?;
        use chrono::TimeZone;
        let Some(dt) = chrono::Utc.timestamp_millis_opt(millis).single() else {
            return self.fail(Error::Encode(format!("timestamp {millis} out of range")));
        };
        let text = if utc {
            dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
        } else {
            dt.with_timezone(&chrono::Local)
                .to_rfc3339_opts(chrono::SecondsFormat::AutoSi, false)
        };
        self.write_str(&text)
    }

    /// Copy pre-encoded bytes into the output as one value cell.
    pub fn write_raw(&mut self, cell: &[u8]) -> Result<()> {
        self.guard()?;
        if cell.is_empty() {
            return self.fail(Error::Encode("empty raw value".into()));
        }
        self.align();
        let addr = self.here();
        self.out.extend_from_slice(cell);
        self.push_slot(Slot::Ref(addr))
    }

    /// Deep-copy an existing value tree into the output.
    pub fn write_value(&mut self, value: &Value<'_>) -> Result<()> {
        self.guard()?;
        self.write_value_at(value, 0)
    }

    fn write_value_at(&mut self, value: &Value<'_>, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return self.fail(Error::Encode("value tree too deep".into()));
        }
        // A value that already lives in the base is referenced in place
        // rather than copied.
        if let Some(base) = &self.base {
            if std::ptr::eq(value.data().as_ptr(), base.as_ptr())
                && value.data().len() == base.len()
            {
                return self.push_slot(Slot::Ref(value.offset()));
            }
        }
        match value.typed() {
            Typed::Undefined => self.write_undefined(),
            Typed::Null => self.write_null(),
            Typed::Bool(b) => self.write_bool(b),
            Typed::Int(n) => self.write_int(n),
            Typed::UInt(n) => self.write_uint(n),
            Typed::Float(x) => self.write_float(x),
            Typed::Double(x) => self.write_double(x),
            Typed::Str(s) => self.write_str(s),
            Typed::Data(b) => self.write_data(b),
            Typed::Array(arr) => {
                self.begin_array(arr.count())?;
                for item in arr.iter() {
                    self.write_value_at(&item, depth + 1)?;
                }
                self.end_array()
            }
            Typed::Map(map) => {
                self.begin_map(map.count())?;
                for (key, item) in map.iter() {
                    match (key.string(), key.code()) {
                        (Some(text), _) => self.write_key(&text)?,
                        // An unresolvable code is carried over verbatim.
                        (None, Some(code)) => {
                            self.push_key_slot(Slot::Inline(encode_short_int(code as i16)))?;
                        }
                        (None, None) => {
                            return self.fail(Error::Encode("unreadable map key".into()))
                        }
                    }
                    self.write_value_at(&item, depth + 1)?;
                }
                self.end_map()
            }
        }
    }

    // --- Containers ---

    /// Open an array. `hint` reserves slot capacity.
    pub fn begin_array(&mut self, hint: usize) -> Result<()> {
        self.guard()?;
        // An array opened in a map position consumes the pending value.
        let top = self.stack.last_mut().expect("stack bottom always present");
        if top.map && top.expecting_key {
            return self.fail(Error::Encode("expected a key before this value".into()));
        }
        self.stack.push(Pending {
            map: false,
            slots: Vec::with_capacity(hint),
            expecting_key: false,
        });
        Ok(())
    }

    pub fn end_array(&mut self) -> Result<()> {
        self.guard()?;
        let top = self.stack.pop().expect("stack bottom always present");
        if top.map || self.stack.is_empty() {
            self.stack.push(top);
            return self.fail(Error::Encode("end_array does not match an open array".into()));
        }
        let count = top.slots.len();
        let addr = self.emit_container(false, top.slots, count)?;
        self.push_slot(Slot::Ref(addr))
    }

    /// Open a map. `hint` reserves pair capacity.
    pub fn begin_map(&mut self, hint: usize) -> Result<()> {
        self.guard()?;
        let top = self.stack.last_mut().expect("stack bottom always present");
        if top.map && top.expecting_key {
            return self.fail(Error::Encode("expected a key before this value".into()));
        }
        self.stack.push(Pending {
            map: true,
            slots: Vec::with_capacity(hint * 2),
            expecting_key: true,
        });
        Ok(())
    }

    pub fn end_map(&mut self) -> Result<()> {
        self.guard()?;
        let top = self.stack.pop().expect("stack bottom always present");
        if !top.map || self.stack.is_empty() {
            self.stack.push(top);
            return self.fail(Error::Encode("end_map does not match an open map".into()));
        }
        if !top.expecting_key && !top.slots.is_empty() {
            self.stack.push(top);
            return self.fail(Error::Encode("map key written without a value".into()));
        }
        let mut pairs: Vec<(Slot, Slot)> = top
            .slots
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect();
        self.sort_map_pairs(&mut pairs);
        let count = pairs.len();
        let slots: Vec<Slot> = pairs.into_iter().flat_map(|(k, v)| [k, v]).collect();
        let addr = self.emit_container(true, slots, count)?;
        self.push_slot(Slot::Ref(addr))
    }

    /// Write a map key. Eligible keys are interned through the attached
    /// shared-key table; otherwise the string itself is the key (uniqued
    /// like any other string).
    pub fn write_key(&mut self, key: &str) -> Result<()> {
        self.guard()?;
        if let Some(sk) = &self.shared_keys {
            if let Some(code) = sk.encode_and_add(key) {
                return self.push_key_slot(Slot::Inline(encode_short_int(code as i16)));
            }
        }
        let slot = self.str_slot(key.as_bytes(), true);
        self.push_key_slot(slot)
    }

    /// Write a map key from an existing value (a string, or an integer
    /// code belonging to this encoder's shared-key table).
    pub fn write_key_value(&mut self, key: &Value<'_>) -> Result<()> {
        self.guard()?;
        match key.typed() {
            Typed::Str(s) => self.write_key(s),
            Typed::Int(code @ 0..=2047) => {
                self.push_key_slot(Slot::Inline(encode_short_int(code as i16)))
            }
            _ => self.fail(Error::Encode("map key must be a string or key code".into())),
        }
    }

    /// Write a map key from a precomputed handle.
    pub fn write_map_key(&mut self, key: &MapKey) -> Result<()> {
        self.write_key(key.text())
    }

    /// Decode a buffered key slot for sorting.
    fn owned_key(&self, slot: Slot) -> OwnedKey {
        match slot {
            Slot::Inline([b0, b1]) => {
                if b0 >> 4 == 0x4 {
                    let len = (b0 & 0x0F) as usize;
                    OwnedKey::Str(if len == 0 { Vec::new() } else { vec![b1] })
                } else {
                    OwnedKey::Int(crate::tag::Header(b0, b1).short_int())
                }
            }
            Slot::Ref(addr) => {
                let bytes = self.cell_bytes(addr);
                match Value::at(bytes, 0).map(|v| v.typed()) {
                    Some(Typed::Str(s)) => OwnedKey::Str(s.as_bytes().to_vec()),
                    Some(Typed::Int(n)) => OwnedKey::Int(n),
                    _ => OwnedKey::Str(Vec::new()),
                }
            }
        }
    }

    /// The buffer bytes starting at a logical address (within base or out).
    fn cell_bytes(&self, addr: u32) -> &[u8] {
        let addr = addr as usize;
        if addr < self.base_len {
            let base = self.base.as_ref().expect("base present when base_len > 0");
            &base[addr..]
        } else {
            &self.out[addr - self.base_len..]
        }
    }

    fn sort_map_pairs(&self, pairs: &mut [(Slot, Slot)]) {
        let mut keyed: Vec<(OwnedKey, (Slot, Slot))> = pairs
            .iter()
            .map(|&pair| (self.owned_key(pair.0), pair))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        for (dst, (_, pair)) in pairs.iter_mut().zip(keyed) {
            *dst = pair;
        }
    }

    /// Emit a closed container and return its header address.
    fn emit_container(&mut self, map: bool, slots: Vec<Slot>, count: usize) -> Result<u32> {
        self.align();
        let header_addr = self.here();

        // Header, plus varint count for wide-count containers.
        let inline_count = if count >= CONTAINER_COUNT_ESCAPE as usize {
            CONTAINER_COUNT_ESCAPE
        } else {
            count as u16
        };
        let mut prefix: Vec<u8> = Vec::with_capacity(4);
        prefix.extend_from_slice(&encode_container_header(map, false, inline_count));
        if inline_count == CONTAINER_COUNT_ESCAPE {
            tag::write_varint(&mut prefix, count as u64);
            if prefix.len() % 2 != 0 {
                prefix.push(0);
            }
        }

        // Pick the width: narrow unless some pointer cannot reach.
        let first_slot = header_addr as usize + prefix.len();
        let narrow_ok = slots.iter().enumerate().all(|(i, slot)| match slot {
            Slot::Inline(_) => true,
            Slot::Ref(target) => {
                let slot_addr = first_slot + 2 * i;
                slot_addr - *target as usize <= NARROW_POINTER_MAX
            }
        });
        let wide = !narrow_ok;
        if wide {
            prefix[0] |= 0x08;
        }
        let width = if wide { 4 } else { 2 };

        self.out.extend_from_slice(&prefix);
        for (i, slot) in slots.iter().enumerate() {
            let slot_addr = first_slot + width * i;
            match slot {
                Slot::Inline(cell) => {
                    self.out.extend_from_slice(cell);
                    if wide {
                        self.out.extend_from_slice(&[0, 0]);
                    }
                }
                Slot::Ref(target) => {
                    let distance = slot_addr - *target as usize;
                    let units = (distance / 2) as u32;
                    if wide {
                        self.out.extend_from_slice(&encode_wide_pointer(units));
                    } else {
                        self.out.extend_from_slice(&encode_narrow_pointer(units));
                    }
                }
            }
        }
        Ok(header_addr)
    }

    // --- Finish ---

    /// Write the trailer and return the encoded bytes, resetting the
    /// encoder for reuse. With a base attached, only the amendment bytes
    /// are returned.
    pub fn finish(&mut self) -> Result<Vec<u8>> {
        if let Some(e) = self.error.take() {
            self.reset();
            return Err(e);
        }
        if self.stack.len() != 1 {
            let e = Error::Encode("finish with an open container".into());
            self.reset();
            return Err(e);
        }
        let Some(&root_slot) = self.stack[0].slots.last() else {
            let e = Error::Encode("nothing written".into());
            self.reset();
            return Err(e);
        };

        let root = match root_slot {
            Slot::Ref(addr) => addr,
            Slot::Inline(cell) => {
                self.align();
                let addr = self.here();
                self.out.extend_from_slice(&cell);
                addr
            }
        };

        if !self.suppress_trailer {
            self.align();
            let mut units = (self.here() - root) / 2;
            if units > 0x7FFF {
                // Root too far for the narrow trailer: indirect through a
                // wide pointer just before it.
                self.out.extend_from_slice(&encode_wide_pointer(units));
                units = 2;
            }
            self.out.extend_from_slice(&encode_narrow_pointer(units));
        }

        let bytes = std::mem::take(&mut self.out);
        self.reset();
        Ok(bytes)
    }

    /// Finish and wrap the result in a [`Doc`] carrying this encoder's
    /// shared keys. An amendment finishes to a `Doc` only when it was
    /// opened with extern pointers (the base becomes the extern
    /// destination).
    pub fn finish_doc(&mut self) -> Result<Doc> {
        let shared_keys = self.shared_keys.clone();
        let base = self.base.clone();
        let extern_pointers = self.extern_pointers;
        if base.is_some() && !extern_pointers {
            let e = Error::Unsupported("finish_doc on a concatenation amendment");
            let _ = self.fail(e.clone());
            return Err(e);
        }
        let bytes = self.finish()?;
        Doc::from_data(bytes, Trust::Trusted, shared_keys, base)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("bytes_written", &self.out.len())
            .field("open_containers", &(self.stack.len() - 1))
            .field("base_len", &self.base_len)
            .field("failed", &self.error.is_some())
            .finish()
    }
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum OwnedKey {
    Int(i64),
    Str(Vec<u8>),
}

/// Minimal byte count that round-trips `v` through sign extension.
fn signed_byte_count(v: i64) -> usize {
    let mut n = 1;
    while n < 8 {
        let bits = 64 - 8 * n as u32;
        if (v << bits) >> bits == v {
            break;
        }
        n += 1;
    }
    n
}

/// Minimal byte count for an unsigned value.
fn unsigned_byte_count(v: u64) -> usize {
    (8 - v.leading_zeros() as usize / 8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_counts() {
        assert_eq!(signed_byte_count(0), 1);
        assert_eq!(signed_byte_count(127), 1);
        assert_eq!(signed_byte_count(128), 2);
        assert_eq!(signed_byte_count(-128), 1);
        assert_eq!(signed_byte_count(-129), 2);
        assert_eq!(signed_byte_count(i64::MAX), 8);
        assert_eq!(unsigned_byte_count(0), 1);
        assert_eq!(unsigned_byte_count(255), 1);
        assert_eq!(unsigned_byte_count(256), 2);
        assert_eq!(unsigned_byte_count(u64::MAX), 8);
    }

    #[test]
    fn test_scalar_root() {
        let mut enc = Encoder::new();
        enc.write_int(42).unwrap();
        let bytes = enc.finish().unwrap();
        assert_eq!(bytes, [0x00, 0x2A, 0x80, 0x01]);

        let v = Value::from_data(&bytes).unwrap();
        assert_eq!(v.as_int(), 42);
    }

    #[test]
    fn test_out_of_line_int_root() {
        let mut enc = Encoder::new();
        enc.write_int(0x1234).unwrap();
        let bytes = enc.finish().unwrap();
        // [int header n=2][34 12][pad][trailer back 2 units]
        assert_eq!(bytes, [0x11, 0x34, 0x12, 0x00, 0x80, 0x02]);
        let v = Value::from_data(&bytes).unwrap();
        assert_eq!(v.as_int(), 0x1234);
    }

    #[test]
    fn test_array_roundtrip() {
        let mut enc = Encoder::new();
        enc.begin_array(3).unwrap();
        enc.write_int(1).unwrap();
        enc.write_str("hello world").unwrap();
        enc.write_bool(true).unwrap();
        enc.end_array().unwrap();
        let bytes = enc.finish().unwrap();

        let root = Value::from_data(&bytes).unwrap();
        let arr = root.as_array();
        assert_eq!(arr.count(), 3);
        assert_eq!(arr.get(0).unwrap().as_int(), 1);
        assert_eq!(arr.get(1).unwrap().as_str(), "hello world");
        assert!(arr.get(2).unwrap().as_bool());
    }

    #[test]
    fn test_map_sorted_on_end() {
        let mut enc = Encoder::new();
        enc.begin_map(0).unwrap();
        enc.write_key("zebra").unwrap();
        enc.write_int(1).unwrap();
        enc.write_key("apple").unwrap();
        enc.write_int(2).unwrap();
        enc.end_map().unwrap();
        let bytes = enc.finish().unwrap();

        let map = Value::from_data(&bytes).unwrap().as_map();
        assert_eq!(map.get("zebra").unwrap().as_int(), 1);
        assert_eq!(map.get("apple").unwrap().as_int(), 2);
        let keys: Vec<String> = map
            .iter()
            .map(|(k, _)| k.string().unwrap().into_owned())
            .collect();
        assert_eq!(keys, ["apple", "zebra"]);
    }

    #[test]
    fn test_string_uniquing() {
        let mut enc = Encoder::new();
        enc.begin_array(2).unwrap();
        enc.write_str("repeated").unwrap();
        enc.write_str("repeated").unwrap();
        enc.end_array().unwrap();
        let unique_len = enc.finish().unwrap().len();

        let mut enc = Encoder::with_options(EncoderOptions {
            unique_strings: false,
            ..EncoderOptions::default()
        });
        enc.begin_array(2).unwrap();
        enc.write_str("repeated").unwrap();
        enc.write_str("repeated").unwrap();
        enc.end_array().unwrap();
        let dup_len = enc.finish().unwrap().len();

        assert!(unique_len < dup_len);
    }

    #[test]
    fn test_sticky_error() {
        let mut enc = Encoder::new();
        enc.begin_map(0).unwrap();
        // Value without a key: the first, original error.
        assert!(matches!(enc.write_int(1), Err(Error::Encode(_))));
        // Subsequent writes are no-ops reporting the failed state.
        assert!(matches!(enc.write_int(2), Err(Error::EncoderFailed)));
        assert!(enc.error().is_some());
        // finish surfaces the original error and resets.
        assert!(matches!(enc.finish(), Err(Error::Encode(_))));
        enc.write_int(3).unwrap();
        assert!(enc.finish().is_ok());
    }

    #[test]
    fn test_empty_encoder_fails() {
        let mut enc = Encoder::new();
        assert!(matches!(enc.finish(), Err(Error::Encode(_))));
    }

    #[test]
    fn test_unclosed_container_fails() {
        let mut enc = Encoder::new();
        enc.begin_array(0).unwrap();
        assert!(enc.finish().is_err());
    }

    #[test]
    fn test_shared_key_interning() {
        let sk = Arc::new(SharedKeys::new());
        let mut enc = Encoder::new();
        enc.set_shared_keys(Arc::clone(&sk));
        enc.begin_map(1).unwrap();
        enc.write_key("name").unwrap();
        enc.write_str("ada").unwrap();
        enc.write_key("not eligible!").unwrap();
        enc.write_int(1).unwrap();
        enc.end_map().unwrap();
        let doc = enc.finish_doc().unwrap();

        assert_eq!(sk.encode("name"), Some(0));
        assert_eq!(sk.encode("not eligible!"), None);
        let map = doc.root().as_map();
        assert_eq!(map.get("name").unwrap().as_str(), "ada");
        assert_eq!(map.get("not eligible!").unwrap().as_int(), 1);
        // Iteration decodes the interned key back through the table.
        let keys: Vec<String> = map
            .iter()
            .map(|(k, _)| k.string().unwrap().into_owned())
            .collect();
        assert_eq!(keys, ["name", "not eligible!"]);
    }

    #[test]
    fn test_amendment_concat() {
        let mut enc = Encoder::new();
        enc.begin_map(1).unwrap();
        enc.write_key("a").unwrap();
        enc.write_str("shared-text").unwrap();
        enc.end_map().unwrap();
        let base: Arc<[u8]> = Arc::from(enc.finish().unwrap().as_slice());

        let mut enc = Encoder::new();
        enc.set_base(Arc::clone(&base), false).unwrap();
        enc.reuse_base_strings().unwrap();
        enc.begin_array(3).unwrap();
        // The base root is referenced in place, not copied.
        let base_root = Value::from_trusted_data(&base).unwrap();
        enc.write_value(&base_root).unwrap();
        // A string already present in the base becomes a back-pointer.
        enc.write_str("shared-text").unwrap();
        enc.write_int(2).unwrap();
        enc.end_array().unwrap();
        let amendment = enc.finish().unwrap();
        // Far smaller than re-embedding the map and the string.
        assert!(amendment.len() < base.len());

        let combined = [&base[..], &amendment[..]].concat();
        let root = Value::from_data(&combined).unwrap();
        let arr = root.as_array();
        assert_eq!(arr.count(), 3);
        let inner = arr.get(0).unwrap().as_map();
        assert_eq!(inner.get("a").unwrap().as_str(), "shared-text");
        assert_eq!(arr.get(1).unwrap().as_str(), "shared-text");
        assert_eq!(arr.get(2).unwrap().as_int(), 2);
    }

    #[test]
    fn test_write_value_deep_copy() {
        let mut enc = Encoder::new();
        enc.begin_map(1).unwrap();
        enc.write_key("xs").unwrap();
        enc.begin_array(2).unwrap();
        enc.write_int(1).unwrap();
        enc.write_double(2.5).unwrap();
        enc.end_array().unwrap();
        enc.end_map().unwrap();
        let original = enc.finish().unwrap();
        let source = Value::from_data(&original).unwrap();

        let mut enc = Encoder::new();
        enc.write_value(&source).unwrap();
        let copy = enc.finish().unwrap();
        let copied = Value::from_data(&copy).unwrap();
        assert!(source.is_equal(&copied));
    }

    #[test]
    fn test_reset_reusable() {
        let mut enc = Encoder::new();
        enc.write_int(1).unwrap();
        enc.reset();
        enc.write_int(2).unwrap();
        let bytes = enc.finish().unwrap();
        assert_eq!(Value::from_data(&bytes).unwrap().as_int(), 2);
    }
}
