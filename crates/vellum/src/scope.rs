//! Scope/Doc registry: process-wide lookup from a raw address inside a
//! value tree back to the owning byte range, its shared-key table, and its
//! extern-pointer destination.
//!
//! The registry is an ordered map keyed by each registered range's end
//! address, guarded by a single mutex. Lookup for an address `p` finds the
//! smallest end address above `p` and verifies `p` is past the range start;
//! duplicate end keys are permitted and the narrowest match wins, which
//! supports sub-scopes nested inside a parent's range. Registration happens
//! on Doc lifetime boundaries, not per read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::shared_keys::SharedKeys;
use crate::value::Value;

static REGISTRY: Lazy<Mutex<BTreeMap<usize, Vec<Registration>>>> =
    Lazy::new(|| Mutex::new(BTreeMap::new()));

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Registration {
    start: usize,
    end: usize,
    id: u64,
    shared_keys: Option<Arc<SharedKeys>>,
    extern_dest: Option<Arc<[u8]>>,
    /// Set for Doc registrations so `Doc::containing` can hand back a
    /// strong reference; dangling for plain scopes.
    doc: Weak<DocInner>,
    #[cfg(debug_assertions)]
    data_hash: u64,
}

impl Registration {
    fn same_config(&self, other: &Registration) -> bool {
        let sk_eq = match (&self.shared_keys, &other.shared_keys) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        let ext_eq = match (&self.extern_dest, &other.extern_dest) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        sk_eq && ext_eq
    }
}

#[cfg(debug_assertions)]
fn hash_range(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Register a range. Contract violations are programming errors and panic:
/// overlapping-but-not-nested ranges, and same-range registrations with
/// differing configuration. An exact duplicate (same range, same config) is
/// an idempotent marker and registers normally.
fn register(reg: Registration) {
    let mut registry = REGISTRY.lock();
    for (_, regs) in registry.range(reg.start + 1..) {
        for existing in regs {
            let overlaps = existing.start < reg.end && reg.start < existing.end;
            if !overlaps {
                continue;
            }
            let identical = existing.start == reg.start && existing.end == reg.end;
            if identical {
                if existing.same_config(&reg) {
                    trace!(
                        start = reg.start,
                        end = reg.end,
                        "duplicate scope registration"
                    );
                } else {
                    error!(
                        start = reg.start,
                        end = reg.end,
                        "incompatible duplicate scope registration"
                    );
                    panic!(
                        "incompatible duplicate Scope for ({:#x} .. {:#x}): \
                         same range, different shared-keys or extern destination",
                        reg.start, reg.end
                    );
                }
            } else {
                let nested = (existing.start <= reg.start && reg.end <= existing.end)
                    || (reg.start <= existing.start && existing.end <= reg.end);
                if !nested {
                    error!(
                        start = reg.start,
                        end = reg.end,
                        other_start = existing.start,
                        other_end = existing.end,
                        "overlapping non-nested scope registration"
                    );
                    panic!(
                        "Scope ({:#x} .. {:#x}) overlaps ({:#x} .. {:#x}) without nesting",
                        reg.start, reg.end, existing.start, existing.end
                    );
                }
            }
        }
    }
    trace!(start = reg.start, end = reg.end, id = reg.id, "register scope");
    registry.entry(reg.end).or_default().push(reg);
}

fn unregister(end: usize, id: u64, current_bytes: Option<&[u8]>) {
    let mut registry = REGISTRY.lock();
    let Some(regs) = registry.get_mut(&end) else {
        return;
    };
    if let Some(pos) = regs.iter().position(|r| r.id == id) {
        let reg = regs.remove(pos);
        trace!(start = reg.start, end, id, "unregister scope");
        #[cfg(debug_assertions)]
        if let Some(bytes) = current_bytes {
            if hash_range(bytes) != reg.data_hash {
                panic!(
                    "memory range ({:#x} .. {:#x}) was altered while its Scope was registered; \
                     the data was freed or overwritten before the Scope was dropped",
                    reg.start, end
                );
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = current_bytes;
    }
    if regs.is_empty() {
        registry.remove(&end);
    }
}

/// Narrowest registered range containing `addr`, mapped through `f`.
fn with_containing<T>(addr: usize, f: impl Fn(&Registration) -> T) -> Option<T> {
    let registry = REGISTRY.lock();
    let (_, regs) = registry.range(addr + 1..).next()?;
    regs.iter()
        .filter(|r| r.start <= addr)
        .max_by_key(|r| r.start)
        .map(f)
}

/// Registration whose range is exactly `start..end`, mapped through `f`.
fn with_exact<T>(start: usize, end: usize, f: impl Fn(&Registration) -> T) -> Option<T> {
    let registry = REGISTRY.lock();
    registry
        .get(&end)?
        .iter()
        .find(|r| r.start == start)
        .map(f)
}

fn with_range_of<T>(data: &[u8], f: impl Fn(&Registration) -> T) -> Option<T> {
    let start = data.as_ptr() as usize;
    let end = start + data.len();
    with_exact(start, end, &f).or_else(|| with_containing(start, &f))
}

/// Shared-key table of the scope owning `data`, if any.
pub(crate) fn shared_keys_for(data: &[u8]) -> Option<Arc<SharedKeys>> {
    with_range_of(data, |reg| reg.shared_keys.clone())?
}

/// Resolve an extern pointer originating inside `data` whose target fell
/// `distance` bytes before the start of `data`. The owning scope's extern
/// destination is treated as immediately preceding the scope's own range.
pub(crate) fn resolve_extern(data: &[u8], distance: usize) -> Option<Value<'_>> {
    let data_start = data.as_ptr() as usize;
    let (dest, scope_start) = with_range_of(data, |reg| (reg.extern_dest.clone(), reg.start))?;
    let dest = dest?;
    // Re-base relative to the scope's start (data may be a sub-range).
    let distance = distance.checked_add(scope_start)?.checked_sub(data_start)?;
    if distance == 0 || distance > dest.len() {
        return None;
    }
    let offset = dest.len() - distance;
    // SAFETY: the destination bytes are retained by the registration, which
    // per the registry contract outlives every Value derived from the
    // scope's range; the returned Value borrows no longer than `data`.
    let slice: &[u8] = unsafe { std::slice::from_raw_parts(dest.as_ptr(), dest.len()) };
    Value::at(slice, u32::try_from(offset).ok()?)
}

/// How much to trust bytes handed to [`Doc::from_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Validate the whole tree; malformed input yields an error.
    Untrusted,
    /// Only read the trailer. Malformed input yields nonsense values; the
    /// caller vouches for the bytes.
    Trusted,
}

/// A registered byte range: raw addresses inside it can be traced back to
/// its shared keys and extern destination. Dropping the scope deregisters
/// it; the underlying bytes must stay alive (and unmodified) until then.
pub struct Scope {
    data: Arc<[u8]>,
    start: usize,
    len: usize,
    shared_keys: Option<Arc<SharedKeys>>,
    extern_dest: Option<Arc<[u8]>>,
    id: u64,
}

impl Scope {
    /// Register `data` with optional shared keys and extern destination.
    #[must_use]
    pub fn new(
        data: Arc<[u8]>,
        shared_keys: Option<Arc<SharedKeys>>,
        extern_dest: Option<Arc<[u8]>>,
    ) -> Self {
        Self::over_range(data, 0, None, shared_keys, extern_dest)
    }

    /// Register a sub-range of a parent scope, inheriting its shared keys
    /// and extern destination.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds of the parent's data.
    #[must_use]
    pub fn sub_scope(parent: &Scope, range: std::ops::Range<usize>) -> Self {
        assert!(
            range.start <= range.end && parent.start + range.end <= parent.start + parent.len,
            "sub-scope range out of bounds"
        );
        Self::over_range(
            Arc::clone(&parent.data),
            parent.start - parent.data.as_ptr() as usize + range.start,
            Some(range.end - range.start),
            parent.shared_keys.clone(),
            parent.extern_dest.clone(),
        )
    }

    fn over_range(
        data: Arc<[u8]>,
        offset: usize,
        len: Option<usize>,
        shared_keys: Option<Arc<SharedKeys>>,
        extern_dest: Option<Arc<[u8]>>,
    ) -> Self {
        let len = len.unwrap_or(data.len() - offset);
        let start = data.as_ptr() as usize + offset;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let scope = Self {
            data,
            start,
            len,
            shared_keys,
            extern_dest,
            id,
        };
        if len > 0 {
            register(scope.registration(Weak::new()));
        }
        scope
    }

    fn registration(&self, doc: Weak<DocInner>) -> Registration {
        Registration {
            start: self.start,
            end: self.start + self.len,
            id: self.id,
            shared_keys: self.shared_keys.clone(),
            extern_dest: self.extern_dest.clone(),
            doc,
            #[cfg(debug_assertions)]
            data_hash: hash_range(self.range_bytes()),
        }
    }

    fn range_bytes(&self) -> &[u8] {
        let offset = self.start - self.data.as_ptr() as usize;
        &self.data[offset..offset + self.len]
    }

    /// The bytes this scope covers.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.range_bytes()
    }

    #[must_use]
    pub fn shared_keys(&self) -> Option<&Arc<SharedKeys>> {
        self.shared_keys.as_ref()
    }

    #[must_use]
    pub fn extern_destination(&self) -> Option<&Arc<[u8]>> {
        self.extern_dest.as_ref()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if self.len > 0 {
            unregister(self.start + self.len, self.id, Some(self.range_bytes()));
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &self.len)
            .field("shared_keys", &self.shared_keys.is_some())
            .field("extern_dest", &self.extern_dest.is_some())
            .finish()
    }
}

struct DocInner {
    scope: Scope,
    root: u32,
}

/// An owned byte range forming a complete document with a known root.
///
/// A `Doc` is a [`Scope`] plus a root value. It is cheaply cloneable;
/// clones share ownership of the bytes, and [`Value`]s borrowed from a
/// `Doc` stay valid as long as any clone is alive.
#[derive(Clone)]
pub struct Doc {
    inner: Arc<DocInner>,
}

impl Doc {
    /// Open encoded bytes as a document.
    ///
    /// `Trust::Untrusted` validates the whole tree and fails with
    /// [`Error::NoRoot`] on malformed input; `Trust::Trusted` only reads
    /// the trailer.
    pub fn from_data(
        data: impl Into<Arc<[u8]>>,
        trust: Trust,
        shared_keys: Option<Arc<SharedKeys>>,
        extern_dest: Option<Arc<[u8]>>,
    ) -> Result<Self> {
        let data: Arc<[u8]> = data.into();
        let extern_len = extern_dest.as_ref().map_or(0, |d| d.len());
        let root = match trust {
            Trust::Untrusted => Value::from_data_extern(&data, extern_len),
            Trust::Trusted => Value::from_trusted_data(&data),
        }
        .ok_or(Error::NoRoot)?
        .offset();

        // Build the scope unregistered, then register carrying the Doc
        // backlink so `containing` can return a strong reference.
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let start = data.as_ptr() as usize;
        let len = data.len();
        let scope = Scope {
            data,
            start,
            len,
            shared_keys,
            extern_dest,
            id,
        };
        let inner = Arc::new(DocInner { scope, root });
        register(inner.scope.registration(Arc::downgrade(&inner)));
        Ok(Self { inner })
    }

    /// Parse JSON text into a new document.
    pub fn from_json(json: &str) -> Result<Self> {
        crate::json::from_json(json)
    }

    /// The root value.
    #[must_use]
    pub fn root(&self) -> Value<'_> {
        Value::at(self.inner.scope.data(), self.inner.root)
            .unwrap_or_else(|| Value::undefined())
    }

    /// The document bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.inner.scope.data()
    }

    #[must_use]
    pub fn shared_keys(&self) -> Option<&Arc<SharedKeys>> {
        self.inner.scope.shared_keys()
    }

    /// The document owning `value`, if it lies inside a live registered
    /// `Doc`.
    #[must_use]
    pub fn containing(value: &Value<'_>) -> Option<Doc> {
        with_containing(value.address(), |reg| reg.doc.upgrade())?
            .map(|inner| Doc { inner })
    }
}

// DocInner's Scope deregisters in its own Drop.

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("len", &self.data().len())
            .field("root", &format_args!("{:#x}", self.inner.root))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Typed;

    fn doc_42() -> Arc<[u8]> {
        Arc::from(&[0x00u8, 0x2A, 0x80, 0x01][..])
    }

    #[test]
    fn test_doc_roundtrip_and_containing() {
        let doc = Doc::from_data(doc_42(), Trust::Untrusted, None, None).unwrap();
        let root = doc.root();
        assert!(matches!(root.typed(), Typed::Int(42)));

        let found = Doc::containing(&root).expect("root should resolve to its doc");
        assert_eq!(found.data().as_ptr(), doc.data().as_ptr());

        // A value on the stack belongs to no doc.
        let loose = [0x00u8, 0x07];
        let v = Value::at(&loose, 0).unwrap();
        assert!(Doc::containing(&v).is_none());
    }

    #[test]
    fn test_untrusted_rejects_garbage() {
        let garbage: Arc<[u8]> = Arc::from(&[0xFFu8, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(
            Doc::from_data(garbage, Trust::Untrusted, None, None),
            Err(Error::NoRoot)
        ));
    }

    #[test]
    fn test_containing_released_after_drop() {
        let data = doc_42();
        let doc = Doc::from_data(Arc::clone(&data), Trust::Untrusted, None, None).unwrap();
        let addr_probe = {
            let root = doc.root();
            assert!(Doc::containing(&root).is_some());
            root.offset()
        };
        drop(doc);
        // The registration is gone; the same bytes no longer resolve.
        let v = Value::at(&data, addr_probe).unwrap();
        assert!(Doc::containing(&v).is_none());
    }

    #[test]
    fn test_shared_keys_exposed() {
        let sk = Arc::new(SharedKeys::new());
        sk.encode_and_add("name").unwrap();
        let doc = Doc::from_data(doc_42(), Trust::Untrusted, Some(Arc::clone(&sk)), None).unwrap();
        let via_registry = shared_keys_for(doc.data()).unwrap();
        assert!(Arc::ptr_eq(&via_registry, &sk));
    }

    #[test]
    fn test_sub_scope_narrowest_wins() {
        let bytes: Arc<[u8]> = Arc::from(&[0x00u8, 0x01, 0x00, 0x02, 0x80, 0x02][..]);
        let sk = Arc::new(SharedKeys::new());
        let parent = Scope::new(Arc::clone(&bytes), Some(Arc::clone(&sk)), None);
        let sub = Scope::sub_scope(&parent, 0..2);

        // An address inside the sub range resolves to the sub scope's
        // registration (same start, smaller end).
        let addr = bytes.as_ptr() as usize;
        let start = with_containing(addr, |reg| reg.start).unwrap();
        let end_minus_start =
            with_containing(addr, |reg| reg.end - reg.start).unwrap();
        assert_eq!(start, addr);
        assert_eq!(end_minus_start, 2);

        // An address past the sub range resolves to the parent.
        let tail = with_containing(addr + 4, |reg| reg.end - reg.start).unwrap();
        assert_eq!(tail, bytes.len());
        drop(sub);
        drop(parent);
    }

    #[test]
    fn test_extern_pointer_resolution() {
        // Base document: short int 42 + trailer.
        let base: Arc<[u8]> = Arc::from(&[0x00u8, 0x2A, 0x80, 0x01][..]);
        // Amendment: [array of 1: pointer 3 units back -> 4 bytes before
        // start][trailer]. The pointer re-bases into the base at offset 0.
        let amendment: Arc<[u8]> =
            Arc::from(&[0x60u8, 0x01, 0x80, 0x03, 0x80, 0x02][..]);

        let doc = Doc::from_data(
            amendment,
            Trust::Untrusted,
            None,
            Some(Arc::clone(&base)),
        )
        .unwrap();
        let arr = doc.root().as_array();
        assert_eq!(arr.count(), 1);
        let elem = arr.get(0).expect("extern pointer should resolve");
        assert!(matches!(elem.typed(), Typed::Int(42)));
    }

    #[test]
    fn test_extern_out_of_bounds() {
        let base: Arc<[u8]> = Arc::from(&[0x00u8, 0x2A, 0x80, 0x01][..]);
        // Pointer reaches 6 bytes before start but the base is only 4 long.
        let amendment: Arc<[u8]> =
            Arc::from(&[0x60u8, 0x01, 0x80, 0x04, 0x80, 0x02][..]);
        assert!(matches!(
            Doc::from_data(amendment, Trust::Untrusted, None, Some(base)),
            Err(Error::NoRoot)
        ));
    }
}
