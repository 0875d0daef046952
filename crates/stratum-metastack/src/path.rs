//! Key paths into nested metadata.

use std::fmt;

use crate::value::{Map, Value};

/// A sequence of mapping keys, written `a/b/c` in its string form.
///
/// The empty path addresses the root mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    /// The root path.
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if `prefix` is a (non-strict) prefix of this path.
    pub fn starts_with(&self, prefix: &KeyPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Extend the path by one key.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(key.into());
        Self(segments)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        Self(path.split('/').map(str::to_owned).collect())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}

impl From<&String> for KeyPath {
    fn from(path: &String) -> Self {
        Self::from(path.as_str())
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for KeyPath {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(segments: [&str; N]) -> Self {
        Self(segments.iter().map(|s| (*s).to_owned()).collect())
    }
}

impl From<&KeyPath> for KeyPath {
    fn from(path: &KeyPath) -> Self {
        path.clone()
    }
}

/// Value at `path` inside `map`, drilling through atomic mappings.
pub fn value_at_key_path<'a>(map: &'a Map, path: &KeyPath) -> Option<&'a Value> {
    let (last, parents) = path.segments().split_last()?;
    let mut current = map;
    for key in parents {
        current = current.get(key)?.as_map()?;
    }
    current.get(last)
}

/// Every key path defined in `map`, parents before children.
///
/// Atomic mappings are reported as a single path; their contents are not
/// enumerated.
pub fn map_dict_keys(map: &Map) -> Vec<KeyPath> {
    let mut paths = Vec::new();
    collect_keys(map, &mut Vec::new(), &mut paths);
    paths
}

fn collect_keys(map: &Map, prefix: &mut Vec<String>, paths: &mut Vec<KeyPath>) {
    for (key, value) in map {
        prefix.push(key.clone());
        paths.push(KeyPath(prefix.clone()));
        if let Value::Map(child) = value {
            collect_keys(child, prefix, paths);
        }
        prefix.pop();
    }
}
