//! Span annotations.
//!
//! Tags are string-keyed, typed values attached to a [`Span`]. Keys are
//! unique within a span; writing an existing key overwrites the previous
//! value regardless of type.
//!
//! [`Span`]: crate::Span

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use crate::error::{TraceError, TraceResult};

/// The value part of a span tag.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    /// String values
    Str(Cow<'static, str>),
    /// u64 values
    U64(u64),
    /// f64 values
    F64(f64),
    /// bool values
    Bool(bool),
}

impl TagValue {
    /// The kind of value stored, for diagnostics and mismatch errors.
    pub fn kind(&self) -> TagKind {
        match self {
            TagValue::Str(_) => TagKind::Str,
            TagValue::U64(_) => TagKind::U64,
            TagValue::F64(_) => TagKind::F64,
            TagValue::Bool(_) => TagKind::Bool,
        }
    }
}

impl From<&'static str> for TagValue {
    fn from(value: &'static str) -> Self {
        TagValue::Str(Cow::Borrowed(value))
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(Cow::Owned(value))
    }
}

impl From<Cow<'static, str>> for TagValue {
    fn from(value: Cow<'static, str>) -> Self {
        TagValue::Str(value)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::U64(value)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::F64(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Str(v) => f.write_str(v),
            TagValue::U64(v) => write!(f, "{}", v),
            TagValue::F64(v) => write!(f, "{}", v),
            TagValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Names the four [`TagValue`] variants, used in [`TraceError::TypeMismatch`].
///
/// [`TraceError::TypeMismatch`]: crate::TraceError::TypeMismatch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagKind {
    /// A string value
    Str,
    /// A u64 value
    U64,
    /// A f64 value
    F64,
    /// A bool value
    Bool,
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TagKind::Str => "string",
            TagKind::U64 => "u64",
            TagKind::F64 => "f64",
            TagKind::Bool => "bool",
        })
    }
}

/// An unordered collection of span tags with unique keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TagSet {
    tags: HashMap<Cow<'static, str>, TagValue>,
}

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        TagSet::default()
    }

    /// Insert a tag, overwriting any previous value under the same key.
    pub fn insert(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<TagValue>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Look up a tag by key.
    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    /// Look up a string tag.
    ///
    /// Returns [`TraceError::NotFound`] when the key is absent and
    /// [`TraceError::TypeMismatch`] when it holds a non-string value.
    ///
    /// [`TraceError::NotFound`]: crate::TraceError::NotFound
    /// [`TraceError::TypeMismatch`]: crate::TraceError::TypeMismatch
    pub fn get_str(&self, key: &str) -> TraceResult<&str> {
        match self.get_typed(key, TagKind::Str)? {
            TagValue::Str(v) => Ok(v),
            _ => unreachable!(),
        }
    }

    /// Look up a u64 tag.
    pub fn get_u64(&self, key: &str) -> TraceResult<u64> {
        match self.get_typed(key, TagKind::U64)? {
            TagValue::U64(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    /// Look up a f64 tag.
    pub fn get_f64(&self, key: &str) -> TraceResult<f64> {
        match self.get_typed(key, TagKind::F64)? {
            TagValue::F64(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    /// Look up a bool tag.
    pub fn get_bool(&self, key: &str) -> TraceResult<bool> {
        match self.get_typed(key, TagKind::Bool)? {
            TagValue::Bool(v) => Ok(*v),
            _ => unreachable!(),
        }
    }

    fn get_typed(&self, key: &str, requested: TagKind) -> TraceResult<&TagValue> {
        let value = self.tags.get(key).ok_or_else(|| TraceError::NotFound {
            key: key.to_owned(),
        })?;
        if value.kind() != requested {
            return Err(TraceError::TypeMismatch {
                key: key.to_owned(),
                requested,
                actual: value.kind(),
            });
        }
        Ok(value)
    }

    /// Returns the number of tags in the set.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Returns `true` if the set holds no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Iterate over all tags in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TagValue)> {
        self.tags.iter().map(|(k, v)| (k.as_ref(), v))
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = (&'a Cow<'static, str>, &'a TagValue);
    type IntoIter = std::collections::hash_map::Iter<'a, Cow<'static, str>, TagValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.tags.iter()
    }
}

/// Renders a `host:port` pair from two tags, or just the host when the
/// port tag is absent. `None` when even the host is missing.
pub(crate) fn socket_of(tags: &TagSet, host_key: &str, port_key: &str) -> Option<String> {
    let host = tags.get_str(host_key).ok()?;
    Some(match tags.get(port_key) {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_across_types() {
        let mut tags = TagSet::new();
        tags.insert("db.operation", "get");
        tags.insert("db.operation", 42u64);

        assert_eq!(tags.len(), 1);
        assert_eq!(tags.get_u64("db.operation").unwrap(), 42);
    }

    #[test]
    fn typed_get_reports_missing_key() {
        let tags = TagSet::new();
        match tags.get_str("db.instance") {
            Err(TraceError::NotFound { key }) => assert_eq!(key, "db.instance"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn typed_get_reports_both_kinds_on_mismatch() {
        let mut tags = TagSet::new();
        tags.insert("net.host.port", 11210u64);

        match tags.get_str("net.host.port") {
            Err(TraceError::TypeMismatch {
                key,
                requested,
                actual,
            }) => {
                assert_eq!(key, "net.host.port");
                assert_eq!(requested, TagKind::Str);
                assert_eq!(actual, TagKind::U64);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn typed_get_returns_values() {
        let mut tags = TagSet::new();
        tags.insert("db.instance", "travel-sample");
        tags.insert("net.peer.port", 8093u64);
        tags.insert("peak_rate", 0.5f64);
        tags.insert("local", true);

        assert_eq!(tags.get_str("db.instance").unwrap(), "travel-sample");
        assert_eq!(tags.get_u64("net.peer.port").unwrap(), 8093);
        assert_eq!(tags.get_f64("peak_rate").unwrap(), 0.5);
        assert!(tags.get_bool("local").unwrap());
    }
}
