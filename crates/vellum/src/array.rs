//! Zero-copy array views.

use crate::value::{container_info, deref_slot, ContainerInfo, Value};

/// Zero-copy view into an encoded array.
#[derive(Clone, Copy)]
pub struct Array<'a> {
    value: Value<'a>,
    info: ContainerInfo,
}

impl<'a> Array<'a> {
    /// Wrap a value known to be an array. A malformed header yields an
    /// empty view rather than a panic.
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

    /// The array as a plain [`Value`].
    #[inline]
    #[must_use]
    pub fn value(&self) -> Value<'a> {
        self.value
    }

    /// Number of elements.
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

    /// Get the element at `index`, or `None` past the end.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value<'a>> {
        if index >= self.info.count {
            return None;
        }
        let slot = self.info.first_slot + (index * self.info.width) as u32;
        deref_slot(self.value.data(), slot, self.info.width == 4)
    }

    /// Forward-only iterator over the elements.
    #[must_use]
    pub fn iter(&self) -> ArrayIter<'a> {
        ArrayIter {
            array: *self,
            index: 0,
        }
    }
}

impl<'a> IntoIterator for &Array<'a> {
    type Item = Value<'a>;
    type IntoIter = ArrayIter<'a>;

    fn into_iter(self) -> ArrayIter<'a> {
        self.iter()
    }
}

impl std::fmt::Debug for Array<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("offset", &format_args!("{:#x}", self.value.offset()))
            .field("count", &self.info.count)
            .field("width", &self.info.width)
            .finish()
    }
}

/// Finite, forward-only array iterator. Elements past a malformed slot are
/// skipped (possible only with trusted decoding of bad input).
pub struct ArrayIter<'a> {
    array: Array<'a>,
    index: usize,
}

impl<'a> ArrayIter<'a> {
    /// Elements remaining, including the one `next` would return.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.array.count().saturating_sub(self.index)
    }
}

impl<'a> Iterator for ArrayIter<'a> {
    type Item = Value<'a>;

    fn next(&mut self) -> Option<Value<'a>> {
        while self.index < self.array.count() {
            let i = self.index;
            self.index += 1;
            if let Some(v) = self.array.get(i) {
                return Some(v);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining();
        (0, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Typed;

    // [short 1][short 2][array of 3: inline 1, inline 2, ptr -> offset 0]
    // laid out so the third slot exercises pointer deref.
    fn sample() -> Vec<u8> {
        vec![
            0x00, 0x01, // @0: short int 1
            0x00, 0x02, // @2: short int 2
            0x60, 0x03, // @4: array header, count 3, narrow
            0x00, 0x0A, // @6: slot 0: inline short int 10
            0x00, 0x14, // @8: slot 1: inline short int 20
            0x80, 0x04, // @10: slot 2: pointer back 4 units -> @2
        ]
    }

    #[test]
    fn test_get_and_iter() {
        let data = sample();
        let arr = Array::new(Value::at(&data, 4).unwrap());
        assert_eq!(arr.count(), 3);
        assert!(!arr.is_empty());
        assert!(matches!(arr.get(0).unwrap().typed(), Typed::Int(10)));
        assert!(matches!(arr.get(1).unwrap().typed(), Typed::Int(20)));
        assert!(matches!(arr.get(2).unwrap().typed(), Typed::Int(2)));
        assert!(arr.get(3).is_none());

        let collected: Vec<i64> = arr.iter().map(|v| v.as_int()).collect();
        assert_eq!(collected, [10, 20, 2]);

        let mut it = arr.iter();
        assert_eq!(it.remaining(), 3);
        it.next();
        assert_eq!(it.remaining(), 2);
    }

    #[test]
    fn test_empty() {
        let arr = Value::empty_array().as_array();
        assert!(arr.is_empty());
        assert!(arr.get(0).is_none());
        assert_eq!(arr.iter().count(), 0);
    }
}
