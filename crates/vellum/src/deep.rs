//! Pre-order deep iteration over a value tree.
//!
//! The iterator yields every value below the root together with its path,
//! using an explicit frame stack so adversarially nested documents cannot
//! overflow the control stack (nesting is capped at
//! [`MAX_DEPTH`](crate::value::MAX_DEPTH) like everywhere else). A scalar
//! root is yielded once with an empty path; a container root yields its
//! contents.

use crate::array::Array;
use crate::map::Map;
use crate::value::{Typed, Value, MAX_DEPTH};

/// One step of a deep-iteration path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathComponent {
    /// Map key (decoded through the owning scope's shared keys if coded).
    Key(String),
    /// Array index.
    Index(usize),
}

enum Frame<'a> {
    Array { array: Array<'a>, index: usize },
    Map { map: Map<'a>, pair: usize },
}

/// Pre-order `(path, value)` traversal with child skipping.
pub struct DeepIterator<'a> {
    /// Scalar root not yet yielded; `None` once iteration started on a
    /// container root.
    pending_root: Option<Value<'a>>,
    stack: Vec<Frame<'a>>,
    path: Vec<PathComponent>,
    current: Option<Value<'a>>,
    skip: bool,
}

impl<'a> DeepIterator<'a> {
    #[must_use]
    pub fn new(root: Value<'a>) -> Self {
        let mut it = Self {
            pending_root: None,
            stack: Vec::new(),
            path: Vec::new(),
            current: None,
            skip: false,
        };
        // Every frame owns one path slot, overwritten per child.
        match root.typed() {
            Typed::Array(array) => {
                it.stack.push(Frame::Array { array, index: 0 });
                it.path.push(PathComponent::Index(0));
            }
            Typed::Map(map) => {
                it.stack.push(Frame::Map { map, pair: 0 });
                it.path.push(PathComponent::Index(0));
            }
            _ => it.pending_root = Some(root),
        }
        it
    }

    /// Advance to the next value, returning it. Returns `None` once the
    /// traversal is exhausted; further calls keep returning `None`.
    pub fn next(&mut self) -> Option<Value<'a>> {
        if let Some(root) = self.pending_root.take() {
            self.current = Some(root);
            return self.current;
        }

        // Descend into the value yielded last time, unless skipped.
        if let Some(current) = self.current.take() {
            if self.skip {
                self.skip = false;
            } else if self.stack.len() < MAX_DEPTH {
                match current.typed() {
                    Typed::Array(array) => {
                        self.stack.push(Frame::Array { array, index: 0 });
                        self.path.push(PathComponent::Index(0));
                    }
                    Typed::Map(map) => {
                        self.stack.push(Frame::Map { map, pair: 0 });
                        self.path.push(PathComponent::Index(0));
                    }
                    _ => {}
                }
            }
        }

        loop {
            let frame = self.stack.last_mut()?;
            let child = match frame {
                Frame::Array { array, index } => {
                    if *index >= array.count() {
                        None
                    } else {
                        let i = *index;
                        *index += 1;
                        array.get(i).map(|v| (PathComponent::Index(i), v))
                    }
                }
                Frame::Map { map, pair } => {
                    let mut found = None;
                    for (key, item) in map.iter().skip(*pair) {
                        *pair += 1;
                        let text = key
                            .string()
                            .map(std::borrow::Cow::into_owned)
                            .unwrap_or_else(|| key.code().unwrap_or_default().to_string());
                        found = Some((PathComponent::Key(text), item));
                        break;
                    }
                    found
                }
            };
            match child {
                Some((component, value)) => {
                    if let Some(last) = self.path.last_mut() {
                        *last = component;
                    }
                    self.current = Some(value);
                    return self.current;
                }
                None => {
                    self.stack.pop();
                    self.path.pop();
                    if self.stack.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    /// The value most recently returned by [`next`](Self::next).
    #[must_use]
    pub fn value(&self) -> Option<Value<'a>> {
        self.current
    }

    /// Do not descend into the current value's children.
    pub fn skip_children(&mut self) {
        self.skip = true;
    }

    /// Path of the current value, root-relative.
    #[must_use]
    pub fn path(&self) -> &[PathComponent] {
        // The root frame has no path component; the slice covers only
        // frames entered below it.
        &self.path
    }

    /// Map key of the current value, if its parent is a map.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self.path.last() {
            Some(PathComponent::Key(k)) => Some(k),
            _ => None,
        }
    }

    /// Array index of the current value, if its parent is an array.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self.path.last() {
            Some(PathComponent::Index(i)) => Some(*i),
            _ => None,
        }
    }

    /// Nesting depth of the current value below the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// The path in key-path notation: `a.b[2]`.
    #[must_use]
    pub fn path_string(&self) -> String {
        let mut out = String::new();
        for component in &self.path {
            match component {
                PathComponent::Key(k) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(k);
                }
                PathComponent::Index(i) => {
                    out.push('[');
                    out.push_str(&i.to_string());
                    out.push(']');
                }
            }
        }
        out
    }

    /// The path as an RFC 6901 JSON pointer: `/a/b/2`.
    #[must_use]
    pub fn json_pointer(&self) -> String {
        let mut out = String::new();
        for component in &self.path {
            out.push('/');
            match component {
                PathComponent::Key(k) => {
                    out.push_str(&k.replace('~', "~0").replace('/', "~1"));
                }
                PathComponent::Index(i) => out.push_str(&i.to_string()),
            }
        }
        out
    }
}
