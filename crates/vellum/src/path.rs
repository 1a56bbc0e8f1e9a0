//! Key-paths: compiled `a.b[2]`-style lookups into a value tree.
//!
//! Grammar: `segment ('.' segment | '[' integer ']')*` with an optional
//! leading `$`. A `.` introduces a map key; brackets index an array, with
//! negative indexes counting back from the end. A missing segment
//! evaluates to *undefined* (`None`), not an error.

use crate::error::{Error, Result};
use crate::value::Value;

/// One step of a key-path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
}

/// A parsed key-path, reusable against any number of roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath {
    segments: Vec<Segment>,
}

impl KeyPath {
    /// Parse a key-path string.
    pub fn parse(path: &str) -> Result<Self> {
        let bytes = path.as_bytes();
        let mut pos = 0;
        if bytes.first() == Some(&b'$') {
            pos = 1;
            if bytes.get(1) == Some(&b'.') {
                pos = 2;
            }
        }

        let mut segments = Vec::new();
        let mut expect_key = true; // a bare leading segment is a key
        while pos < bytes.len() {
            match bytes[pos] {
                b'.' => {
                    if expect_key {
                        return Err(Error::PathSyntax {
                            offset: pos,
                            message: "empty key segment",
                        });
                    }
                    pos += 1;
                    expect_key = true;
                }
                b'[' => {
                    let close = path[pos..]
                        .find(']')
                        .map(|i| pos + i)
                        .ok_or(Error::PathSyntax {
                            offset: pos,
                            message: "unterminated index",
                        })?;
                    let index: i64 =
                        path[pos + 1..close]
                            .parse()
                            .map_err(|_| Error::PathSyntax {
                                offset: pos + 1,
                                message: "invalid array index",
                            })?;
                    segments.push(Segment::Index(index));
                    pos = close + 1;
                    expect_key = false;
                }
                _ => {
                    if !expect_key {
                        return Err(Error::PathSyntax {
                            offset: pos,
                            message: "expected '.' or '['",
                        });
                    }
                    let end = bytes[pos..]
                        .iter()
                        .position(|&b| b == b'.' || b == b'[')
                        .map_or(bytes.len(), |i| pos + i);
                    segments.push(Segment::Key(path[pos..end].to_string()));
                    pos = end;
                    expect_key = false;
                }
            }
        }
        if expect_key && !segments.is_empty() {
            return Err(Error::PathSyntax {
                offset: path.len(),
                message: "trailing '.'",
            });
        }
        if segments.is_empty() && !path.is_empty() && path != "$" {
            return Err(Error::PathSyntax {
                offset: 0,
                message: "empty path",
            });
        }
        Ok(Self { segments })
    }

    /// Walk the path from `root`. A missing segment yields `None`.
    #[must_use]
    pub fn eval<'a>(&self, root: &Value<'a>) -> Option<Value<'a>> {
        let mut current = *root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => current.as_map().get(key)?,
                Segment::Index(i) => {
                    let arr = current.as_array();
                    let index = if *i < 0 {
                        usize::try_from(*i + arr.count() as i64).ok()?
                    } else {
                        *i as usize
                    };
                    arr.get(index)?
                }
            };
        }
        Some(current)
    }

    /// Parse and evaluate in one step.
    pub fn eval_once<'a>(path: &str, root: &Value<'a>) -> Result<Option<Value<'a>>> {
        Ok(Self::parse(path)?.eval(root))
    }
}
