//! Zero-copy map views and keyed lookup.
//!
//! Map slots hold alternating key/value pairs sorted by key: shared-key
//! integer codes first (in integer order), then string keys (bytewise).
//! Sortedness makes lookup a binary search. When the owning scope carries a
//! shared-key table, lookup tries the integer form of the key first and
//! falls back to the string form, so maps written with a partially
//! populated table still resolve.

use std::borrow::Cow;
use std::cell::Cell;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::scope;
use crate::shared_keys::SharedKeys;
use crate::value::{container_info, deref_slot, ContainerInfo, Typed, Value};

/// A decoded map key for ordering: integer codes sort before strings.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyToken<'a> {
    Int(i64),
    Str(&'a [u8]),
}

impl Ord for KeyToken<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyToken::Int(a), KeyToken::Int(b)) => a.cmp(b),
            (KeyToken::Int(_), KeyToken::Str(_)) => Ordering::Less,
            (KeyToken::Str(_), KeyToken::Int(_)) => Ordering::Greater,
            (KeyToken::Str(a), KeyToken::Str(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for KeyToken<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Zero-copy view into an encoded map.
#[derive(Clone, Copy)]
pub struct Map<'a> {
    value: Value<'a>,
    info: ContainerInfo,
}

impl<'a> Map<'a> {
    #[must_use]
    pub(crate) fn new(value: Value<'a>) -> Self {
        let info = container_info(value.data(), value.offset()).unwrap_or(ContainerInfo {
            slots: 0,
            count: 0,
            width: 2,
            first_slot: value.offset() + 2,
        });
        Self { value, info }
    }

    /// The map as a plain [`Value`].
    #[inline]
    #[must_use]
    pub fn value(&self) -> Value<'a> {
        self.value
    }

    /// Number of key/value pairs.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.info.count
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.info.count == 0
    }

    fn key_slot(&self, pair: usize) -> u32 {
        self.info.first_slot + (pair * 2 * self.info.width) as u32
    }

    fn value_slot(&self, pair: usize) -> u32 {
        self.key_slot(pair) + self.info.width as u32
    }

    /// The key cell of a pair as a plain value (used by the encoder's
    /// base-string reuse).
    pub(crate) fn key_cell(&self, pair: usize) -> Option<Value<'a>> {
        deref_slot(self.value.data(), self.key_slot(pair), self.info.width == 4)
    }

    fn key_token(&self, pair: usize) -> Option<KeyToken<'a>> {
        let key = deref_slot(self.value.data(), self.key_slot(pair), self.info.width == 4)?;
        match key.typed() {
            Typed::Int(n) => Some(KeyToken::Int(n)),
            Typed::Str(s) => Some(KeyToken::Str(s.as_bytes())),
            _ => None,
        }
    }

    fn value_at(&self, pair: usize) -> Option<Value<'a>> {
        deref_slot(self.value.data(), self.value_slot(pair), self.info.width == 4)
    }

    /// Binary search for an exact key token.
    fn search(&self, needle: KeyToken<'_>) -> Option<Value<'a>> {
        let mut lo = 0usize;
        let mut hi = self.info.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_token(mid)?.cmp(&needle) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return self.value_at(mid),
            }
        }
        None
    }

    /// Look up a key. Tries the shared-key integer form first when the
    /// owning scope has a table, then the literal string form.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value<'a>> {
        if let Some(sk) = scope::shared_keys_for(self.value.data()) {
            if let Some(code) = sk.encode(key) {
                if let Some(v) = self.search(KeyToken::Int(i64::from(code))) {
                    return Some(v);
                }
            }
        }
        self.search(KeyToken::Str(key.as_bytes()))
    }

    /// Look up a raw shared-key code (used by deep equality when a code
    /// has no live table to decode through).
    pub(crate) fn get_by_code(&self, code: i64) -> Option<Value<'a>> {
        self.search(KeyToken::Int(code))
    }

    /// Look up via a precomputed [`MapKey`], caching its shared-key
    /// encoding across calls.
    #[must_use]
    pub fn get_key(&self, key: &MapKey) -> Option<Value<'a>> {
        if let Some(sk) = scope::shared_keys_for(self.value.data()) {
            if let Some(code) = key.code_in(&sk) {
                if let Some(v) = self.search(KeyToken::Int(i64::from(code))) {
                    return Some(v);
                }
            }
        }
        self.search(KeyToken::Str(key.text.as_bytes()))
    }

    /// Iterator over `(key, value)` pairs in encoded (= sorted) order.
    #[must_use]
    pub fn iter(&self) -> MapIter<'a> {
        MapIter {
            map: *self,
            pair: 0,
        }
    }
}

impl<'a> IntoIterator for &Map<'a> {
    type Item = (KeyRef<'a>, Value<'a>);
    type IntoIter = MapIter<'a>;

    fn into_iter(self) -> MapIter<'a> {
        self.iter()
    }
}

impl std::fmt::Debug for Map<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("offset", &format_args!("{:#x}", self.value.offset()))
            .field("count", &self.info.count)
            .field("width", &self.info.width)
            .finish()
    }
}

/// A map key as seen by iteration: either a literal string or a shared-key
/// code.
#[derive(Clone, Copy)]
pub struct KeyRef<'a> {
    token: KeyToken<'a>,
    /// Owning range, for shared-key resolution through the registry.
    data: &'a [u8],
}

impl<'a> KeyRef<'a> {
    /// The literal string form, if the key is not integer-coded.
    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        match self.token {
            KeyToken::Str(b) => std::str::from_utf8(b).ok(),
            KeyToken::Int(_) => None,
        }
    }

    /// The shared-key code, if the key is integer-coded.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self.token {
            KeyToken::Int(n) => Some(n),
            KeyToken::Str(_) => None,
        }
    }

    /// The key as a string, decoding shared codes through the owning
    /// scope's table. `None` if the code cannot be resolved.
    #[must_use]
    pub fn string(&self) -> Option<Cow<'a, str>> {
        match self.token {
            KeyToken::Str(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
            KeyToken::Int(n) => {
                let sk = scope::shared_keys_for(self.data)?;
                let code = u16::try_from(n).ok()?;
                sk.decode(code).map(|s| Cow::Owned(s.to_string()))
            }
        }
    }

}

impl std::fmt::Debug for KeyRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.token {
            KeyToken::Int(n) => write!(f, "KeyRef::Code({n})"),
            KeyToken::Str(b) => write!(f, "KeyRef::Str({:?})", String::from_utf8_lossy(b)),
        }
    }
}

/// Iterator over a map's pairs in encoded order.
pub struct MapIter<'a> {
    map: Map<'a>,
    pair: usize,
}

impl<'a> MapIter<'a> {
    /// Pairs remaining, including the one `next` would return.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.map.count().saturating_sub(self.pair)
    }
}

impl<'a> Iterator for MapIter<'a> {
    type Item = (KeyRef<'a>, Value<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pair < self.map.count() {
            let i = self.pair;
            self.pair += 1;
            if let (Some(token), Some(value)) = (self.map.key_token(i), self.map.value_at(i)) {
                return Some((
                    KeyRef {
                        token,
                        data: self.map.value.data(),
                    },
                    value,
                ));
            }
        }
        None
    }
}

/// A precomputed key handle for repeated lookups: caches the shared-key
/// encoding per table so repeated `get_key` calls skip the encode step.
pub struct MapKey {
    text: String,
    /// (table identity, code) of the last resolution; code -1 = not mapped.
    cached: Cell<Option<(usize, i32)>>,
}

impl MapKey {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cached: Cell::new(None),
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    fn code_in(&self, sk: &Arc<SharedKeys>) -> Option<u16> {
        let identity = Arc::as_ptr(sk) as usize;
        if let Some((id, code)) = self.cached.get() {
            if id == identity {
                return u16::try_from(code).ok();
            }
        }
        let code = sk.encode(&self.text);
        self.cached
            .set(Some((identity, code.map_or(-1, i32::from))));
        code
    }
}
