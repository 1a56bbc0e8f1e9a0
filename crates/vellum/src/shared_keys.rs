//! Shared map-key table: a growing bidirectional mapping between short key
//! strings and small integer codes.
//!
//! Codes are assigned densely from 0 and never move; adds are strictly
//! append-only. The table is safe for concurrent readers with one writer at
//! a time (a reader/writer lock around the two maps).

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::value::{Typed, Value};

/// Maximum number of codes a table will assign.
pub const MAX_KEYS: usize = 2048;

/// Maximum byte length of an eligible key.
pub const MAX_KEY_LENGTH: usize = 16;

#[derive(Default)]
struct Inner {
    by_text: FxHashMap<Arc<str>, u16>,
    by_code: Vec<Arc<str>>,
}

/// Append-only {key string <-> code} table.
#[derive(Default)]
pub struct SharedKeys {
    inner: RwLock<Inner>,
}

impl SharedKeys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Is this string allowed in the table? The predicate is a frozen part
    /// of the format: 1..=16 UTF-8 bytes, each an ASCII letter, digit, or
    /// one of `_ - . / $`.
    #[must_use]
    pub fn is_eligible(key: &str) -> bool {
        (1..=MAX_KEY_LENGTH).contains(&key.len())
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'$'))
    }

    /// Number of codes assigned so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().by_code.len()
    }

    /// The existing code for `key`, without adding.
    #[must_use]
    pub fn encode(&self, key: &str) -> Option<u16> {
        self.inner.read().by_text.get(key).copied()
    }

    /// The code for `key`, assigning a new one if the key is eligible and
    /// the table has room. `None` means "not mapped".
    #[must_use]
    pub fn encode_and_add(&self, key: &str) -> Option<u16> {
        if let Some(code) = self.encode(key) {
            return Some(code);
        }
        if !Self::is_eligible(key) {
            return None;
        }
        let mut inner = self.inner.write();
        // Raced adds resolve to the winner's code.
        if let Some(code) = inner.by_text.get(key) {
            return Some(*code);
        }
        if inner.by_code.len() >= MAX_KEYS {
            return None;
        }
        let code = inner.by_code.len() as u16;
        let text: Arc<str> = Arc::from(key);
        inner.by_code.push(Arc::clone(&text));
        inner.by_text.insert(text, code);
        Some(code)
    }

    /// The string for a code, or `None` for an unassigned code.
    #[must_use]
    pub fn decode(&self, code: u16) -> Option<Arc<str>> {
        self.inner.read().by_code.get(code as usize).cloned()
    }

    /// Snapshot of all keys in code order.
    #[must_use]
    pub fn keys(&self) -> Vec<Arc<str>> {
        self.inner.read().by_code.clone()
    }

    /// Serialize the table state: a vellum document whose root is an array
    /// of strings, index = code.
    pub fn state(&self) -> Result<Vec<u8>> {
        let keys = self.keys();
        let mut enc = crate::encoder::Encoder::new();
        enc.begin_array(keys.len())?;
        for key in &keys {
            enc.write_str(key)?;
        }
        enc.end_array()?;
        enc.finish()
    }

    /// Rebuild a table from serialized state.
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let table = Self::new();
        table.load_state(data)?;
        Ok(table)
    }

    /// Merge serialized state into this table. Existing codes must agree
    /// with the incoming state; new codes append.
    pub fn load_state(&self, data: &[u8]) -> Result<()> {
        let root = Value::from_data(data).ok_or(Error::SharedKeysState("unreadable state"))?;
        let Typed::Array(keys) = root.typed() else {
            return Err(Error::SharedKeysState("state root is not an array"));
        };
        for (code, key) in keys.iter().enumerate() {
            let Typed::Str(text) = key.typed() else {
                return Err(Error::SharedKeysState("state entry is not a string"));
            };
            match self.encode_and_add(text) {
                Some(assigned) if assigned as usize == code => {}
                _ => return Err(Error::SharedKeysState("state conflicts with table")),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKeys")
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        assert!(SharedKeys::is_eligible("name"));
        assert!(SharedKeys::is_eligible("user_id"));
        assert!(SharedKeys::is_eligible("a-b.c/d$e"));
        assert!(SharedKeys::is_eligible("0123456789abcdef")); // 16 bytes
        assert!(!SharedKeys::is_eligible(""));
        assert!(!SharedKeys::is_eligible("0123456789abcdefg")); // 17 bytes
        assert!(!SharedKeys::is_eligible("has space"));
        assert!(!SharedKeys::is_eligible("ümlaut"));
    }

    #[test]
    fn test_codes_are_dense_and_stable() {
        let sk = SharedKeys::new();
        assert_eq!(sk.encode_and_add("a"), Some(0));
        assert_eq!(sk.encode_and_add("b"), Some(1));
        assert_eq!(sk.encode_and_add("a"), Some(0));
        assert_eq!(sk.encode("b"), Some(1));
        assert_eq!(sk.encode("c"), None);
        assert_eq!(sk.count(), 2);
        assert_eq!(sk.decode(0).as_deref(), Some("a"));
        assert_eq!(sk.decode(1).as_deref(), Some("b"));
        assert_eq!(sk.decode(2), None);
    }

    #[test]
    fn test_ineligible_not_added() {
        let sk = SharedKeys::new();
        assert_eq!(sk.encode_and_add("not a key!"), None);
        assert_eq!(sk.count(), 0);
    }

    #[test]
    fn test_state_roundtrip() {
        let sk = SharedKeys::new();
        sk.encode_and_add("alpha").unwrap();
        sk.encode_and_add("beta").unwrap();
        let state = sk.state().unwrap();

        let restored = SharedKeys::from_state(&state).unwrap();
        assert_eq!(restored.count(), 2);
        assert_eq!(restored.encode("alpha"), Some(0));
        assert_eq!(restored.encode("beta"), Some(1));

        // Loading compatible state into a live table is a no-op merge.
        sk.load_state(&state).unwrap();
        assert_eq!(sk.count(), 2);
    }

    #[test]
    fn test_state_conflict() {
        let sk = SharedKeys::new();
        sk.encode_and_add("zeta").unwrap();

        let other = SharedKeys::new();
        other.encode_and_add("eta").unwrap();
        let state = other.state().unwrap();

        assert!(matches!(
            sk.load_state(&state),
            Err(Error::SharedKeysState(_))
        ));
    }
}
