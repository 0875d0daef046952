//! Per-node layered metadata store.
//!
//! # Layers
//!
//! Metadata is contributed in three priority bands. Each band holds any
//! number of cells keyed by a source identifier:
//!
//! ```text
//! index 2  Defaults  metadata_defaults:*          lowest priority
//! index 0  Static    group:*, then node:*
//! index 1  Reactors  metadata_reactor:*           highest priority
//! ```
//!
//! Reads fold every cell from the lowest to the highest priority with
//! [`merge_value`], so reactor output overrides static metadata which
//! overrides defaults. Within a band, cells fold in insertion order.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{Error, KeyNotFound, Result};
use crate::merge::{merge_dict, merge_value, merges_with};
use crate::path::KeyPath;
use crate::value::{Map, Value};

/// A priority band in a [`Metastack`].
///
/// Variants are declared, and therefore ordered, by ascending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Layer {
    Defaults,
    Static,
    Reactors,
}

impl Layer {
    /// All layers in fold order.
    pub const ALL: [Layer; 3] = [Layer::Defaults, Layer::Static, Layer::Reactors];

    /// Numeric layer identity.
    pub const fn index(self) -> u8 {
        match self {
            Layer::Static => 0,
            Layer::Reactors => 1,
            Layer::Defaults => 2,
        }
    }

    pub const fn from_index(index: u8) -> Option<Layer> {
        match index {
            0 => Some(Layer::Static),
            1 => Some(Layer::Reactors),
            2 => Some(Layer::Defaults),
            _ => None,
        }
    }
}

/// Sources that contributed to each leaf path of a resolved mapping.
pub type Blame = BTreeMap<KeyPath, Vec<String>>;

#[derive(Debug, Clone, Default)]
struct Partition {
    cells: Vec<(String, Map)>,
    /// Pre-merged cells, present while the partition is cached.
    merged: Option<Map>,
}

impl Partition {
    fn merge_cells(&self) -> Map {
        self.cells
            .iter()
            .fold(Map::new(), |acc, (_, map)| merge_dict(&acc, map))
    }

    /// Mappings to fold for reads, using the cache when present.
    fn views(&self) -> Box<dyn Iterator<Item = &Map> + '_> {
        match &self.merged {
            Some(merged) => Box::new(std::iter::once(merged)),
            None => Box::new(self.cells.iter().map(|(_, map)| map)),
        }
    }
}

/// Layered metadata for one node.
#[derive(Debug, Clone, Default)]
pub struct Metastack {
    partitions: BTreeMap<Layer, Partition>,
}

impl Metastack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as the contribution of `source` to `layer`.
    ///
    /// Returns whether the cell changed. An existing cell keeps its
    /// position among the layer's sources.
    pub fn set_layer(&mut self, layer: Layer, source: impl Into<String>, value: Map) -> Result<bool> {
        validate(&value)?;
        let source = source.into();
        let partition = self.partitions.entry(layer).or_default();
        let changed = match partition.cells.iter_mut().find(|(id, _)| *id == source) {
            Some((_, existing)) => {
                if *existing == value {
                    false
                } else {
                    *existing = value;
                    true
                }
            }
            None => {
                partition.cells.push((source.clone(), value));
                true
            }
        };
        if changed {
            partition.merged = None;
            trace!(layer = layer.index(), %source, "metastack cell updated");
        }
        Ok(changed)
    }

    /// Remove the contribution of `source` to `layer`.
    pub fn remove_layer(&mut self, layer: Layer, source: &str) -> bool {
        let Some(partition) = self.partitions.get_mut(&layer) else {
            return false;
        };
        let before = partition.cells.len();
        partition.cells.retain(|(id, _)| id != source);
        let removed = partition.cells.len() != before;
        if removed {
            partition.merged = None;
        }
        removed
    }

    /// Pre-merge a layer so reads fold one mapping instead of every cell.
    ///
    /// The cache is dropped by the next write to the layer.
    pub fn cache_partition(&mut self, layer: Layer) {
        if let Some(partition) = self.partitions.get_mut(&layer) {
            partition.merged = Some(partition.merge_cells());
        }
    }

    /// The contribution of `source` to `layer`, if any.
    pub fn get_layer(&self, layer: Layer, source: &str) -> Option<&Map> {
        self.partitions
            .get(&layer)?
            .cells
            .iter()
            .find(|(id, _)| id == source)
            .map(|(_, map)| map)
    }

    /// Cells of `layer` in insertion order.
    pub fn layer_cells(&self, layer: Layer) -> impl Iterator<Item = (&str, &Map)> {
        self.partitions
            .get(&layer)
            .into_iter()
            .flat_map(|partition| partition.cells.iter().map(|(id, map)| (id.as_str(), map)))
    }

    /// Every source identifier in fold order.
    pub fn sources(&self) -> Vec<&str> {
        self.partitions
            .values()
            .flat_map(|partition| partition.cells.iter().map(|(id, _)| id.as_str()))
            .collect()
    }

    /// Merged value at `path`.
    pub fn get(&self, path: impl Into<KeyPath>) -> std::result::Result<Value, KeyNotFound> {
        let path = path.into();
        self.lookup(&path).ok_or_else(|| KeyNotFound::new(path))
    }

    /// Merged value at `path`, or `default` when nothing is defined there.
    pub fn get_or(&self, path: impl Into<KeyPath>, default: Value) -> Value {
        self.lookup(&path.into()).unwrap_or(default)
    }

    /// Whether anything is defined at `path`.
    /// Like [`Metastack::get`], but a miss is a plain `None`.
    pub fn find(&self, path: impl Into<KeyPath>) -> Option<Value> {
        self.lookup(&path.into())
    }

    pub fn contains(&self, path: impl Into<KeyPath>) -> bool {
        self.lookup(&path.into()).is_some()
    }

    /// Merge the top-level entry of `path` across every layer, then walk
    /// down the merged value. Reads agree with [`Metastack::resolve_all`].
    fn lookup(&self, path: &KeyPath) -> Option<Value> {
        let Some((first, rest)) = path.segments().split_first() else {
            return Some(Value::Map(self.resolve_all()));
        };
        let top = self
            .partitions
            .values()
            .flat_map(Partition::views)
            .filter_map(|map| map.get(first))
            .fold(None, |acc: Option<Value>, value| match acc {
                Some(current) => Some(merge_value(&current, value)),
                None => Some(value.clone()),
            })?;

        let mut current = &top;
        for key in rest {
            current = current.as_map()?.get(key)?;
        }
        Some(current.clone())
    }

    /// The fully merged mapping.
    pub fn resolve_all(&self) -> Map {
        self.partitions
            .values()
            .flat_map(Partition::views)
            .fold(Map::new(), |acc, map| merge_dict(&acc, map))
    }

    /// The fully merged mapping together with the sources of each leaf.
    pub fn resolve_with_blame(&self) -> (Map, Blame) {
        let mut merged = Map::new();
        let mut blame = Blame::new();
        for partition in self.partitions.values() {
            for (source, map) in &partition.cells {
                record_map(Some(&merged), map, source, &mut Vec::new(), &mut blame);
                merged = merge_dict(&merged, map);
            }
        }
        (merged, blame)
    }
}

fn record_map(base: Option<&Map>, update: &Map, source: &str, path: &mut Vec<String>, blame: &mut Blame) {
    if update.is_empty() {
        if base.map_or(true, Map::is_empty) && !path.is_empty() {
            attribute(blame, path, source);
        }
        return;
    }
    // A populated mapping is no longer a leaf.
    blame.remove(&KeyPath::from(path.clone()));
    for (key, value) in update {
        path.push(key.clone());
        record_value(base.and_then(|m| m.get(key)), value, source, path, blame);
        path.pop();
    }
}

fn record_value(base: Option<&Value>, update: &Value, source: &str, path: &mut Vec<String>, blame: &mut Blame) {
    match (base, update) {
        (Some(Value::Map(base)), Value::Map(update)) => record_map(Some(base), update, source, path, blame),
        (_, Value::Map(update)) => {
            forget(blame, path);
            record_map(None, update, source, path, blame);
        }
        (Some(base), _) if merges_with(base, update) => attribute(blame, path, source),
        _ => {
            forget(blame, path);
            attribute(blame, path, source);
        }
    }
}

fn attribute(blame: &mut Blame, path: &[String], source: &str) {
    let sources = blame.entry(KeyPath::from(path.to_vec())).or_default();
    if !sources.iter().any(|s| s == source) {
        sources.push(source.to_owned());
    }
}

/// Drop attribution for `path` and everything below it.
fn forget(blame: &mut Blame, path: &[String]) {
    let prefix = KeyPath::from(path.to_vec());
    blame.retain(|key, _| !key.starts_with(&prefix));
}

fn validate(map: &Map) -> Result<()> {
    let mut path = Vec::new();
    for (key, value) in map {
        path.push(key.clone());
        validate_value(value, &mut path)?;
        path.pop();
    }
    Ok(())
}

fn validate_value(value: &Value, path: &mut Vec<String>) -> Result<()> {
    let invalid = |path: &[String], reason: String| Error::InvalidMetadata {
        path: KeyPath::from(path.to_vec()),
        reason,
    };
    match value {
        Value::Float(f) if f.is_nan() => Err(invalid(path, "NaN is not a valid metadata value".into())),
        Value::Map(map) => {
            for (key, child) in map {
                path.push(key.clone());
                validate_value(child, path)?;
                path.pop();
            }
            Ok(())
        }
        Value::List(items) | Value::Tuple(items) => {
            items.iter().try_for_each(|item| validate_value(item, path))
        }
        Value::Set(items) => match items.iter().find(|item| !item.is_hashable()) {
            Some(item) => Err(invalid(path, format!("sets cannot contain {} values", item.kind()))),
            None => Ok(()),
        },
        Value::Atomic(inner) => match inner.as_ref() {
            Value::Map(_) | Value::List(_) | Value::Tuple(_) | Value::Set(_) => validate_value(inner, path),
            other => Err(invalid(path, format!("{} values cannot be marked atomic", other.kind()))),
        },
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> Map {
        match Value::from(value) {
            Value::Map(map) => map,
            other => panic!("not a mapping: {other}"),
        }
    }

    fn sources(blame: &Blame, path: &str) -> Vec<String> {
        blame.get(&KeyPath::from(path)).cloned().unwrap_or_default()
    }

    #[test]
    fn layer_indices_round_trip() {
        for layer in Layer::ALL {
            assert_eq!(Layer::from_index(layer.index()), Some(layer));
        }
        assert_eq!(Layer::from_index(3), None);
    }

    #[test]
    fn reactors_override_static_override_defaults() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "metadata_defaults:base", map(json!({"foo": "base"}))).unwrap();
        stack.set_layer(Layer::Static, "group:web", map(json!({"foo": "group"}))).unwrap();
        stack.set_layer(Layer::Reactors, "metadata_reactor:r", map(json!({"foo": "reactor"}))).unwrap();
        assert_eq!(stack.get("foo").unwrap(), Value::from("reactor"));

        assert!(stack.remove_layer(Layer::Reactors, "metadata_reactor:r"));
        assert_eq!(stack.get("foo").unwrap(), Value::from("group"));

        assert!(stack.remove_layer(Layer::Static, "group:web"));
        assert_eq!(stack.get("foo").unwrap(), Value::from("base"));
    }

    #[test]
    fn later_static_cells_override_earlier() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "group:all", map(json!({"port": 80, "tags": ["a"]}))).unwrap();
        stack.set_layer(Layer::Static, "group:web", map(json!({"port": 8080, "tags": ["b"]}))).unwrap();
        stack.set_layer(Layer::Static, "node:web1", map(json!({"port": 8443}))).unwrap();
        assert_eq!(stack.get("port").unwrap(), Value::Int(8443));
        assert_eq!(stack.get("tags").unwrap(), Value::from(json!(["a", "b"])));
    }

    #[test]
    fn set_layer_reports_changes() {
        let mut stack = Metastack::new();
        assert!(stack.set_layer(Layer::Reactors, "r", map(json!({"a": 1}))).unwrap());
        assert!(!stack.set_layer(Layer::Reactors, "r", map(json!({"a": 1}))).unwrap());
        assert!(stack.set_layer(Layer::Reactors, "r", map(json!({"a": 2}))).unwrap());
        assert_eq!(stack.get("a").unwrap(), Value::Int(2));
    }

    #[test]
    fn replacing_a_cell_keeps_its_position() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "first", map(json!({"x": 1}))).unwrap();
        stack.set_layer(Layer::Static, "second", map(json!({"x": 2}))).unwrap();
        stack.set_layer(Layer::Static, "first", map(json!({"x": 3}))).unwrap();
        assert_eq!(stack.get("x").unwrap(), Value::Int(2));
        assert_eq!(stack.sources(), vec!["first", "second"]);
    }

    #[test]
    fn missing_paths() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "node:a", map(json!({"a": {"b": 1}, "s": "x"}))).unwrap();
        assert_eq!(stack.get("a/c").unwrap_err().path, KeyPath::from("a/c"));
        assert!(stack.get("s/inner").is_err());
        assert_eq!(stack.get_or("nope", Value::Int(7)), Value::Int(7));
        assert!(stack.contains(["a", "b"]));
    }

    #[test]
    fn higher_scalar_shadows_lower_subtree() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "d", map(json!({"a": {"b": 1}}))).unwrap();
        stack.set_layer(Layer::Reactors, "r", map(json!({"a": 5}))).unwrap();
        assert!(stack.get("a/b").is_err());
        assert_eq!(stack.get("a").unwrap(), Value::Int(5));
    }

    #[test]
    fn atomic_subtree_replaces_lower_layers() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "d", map(json!({"users": {"root": 1, "admin": 2}}))).unwrap();
        let mut node = Map::new();
        node.insert("users".into(), Value::atomic(Value::from(json!({"deploy": 3}))));
        stack.set_layer(Layer::Static, "node:x", node).unwrap();

        assert!(stack.get("users/root").is_err());
        assert_eq!(stack.get("users/deploy").unwrap(), Value::Int(3));
        let all = stack.resolve_all();
        assert_eq!(all["users"].as_map().unwrap().len(), 1);
    }

    #[test]
    fn plain_mapping_replaces_lower_atomic_mapping() {
        let mut stack = Metastack::new();
        let mut defaults = Map::new();
        defaults.insert("users".into(), Value::atomic(Value::from(json!({"root": 1}))));
        stack.set_layer(Layer::Defaults, "d", defaults).unwrap();
        stack.set_layer(Layer::Static, "node:x", map(json!({"users": {"deploy": 3}}))).unwrap();

        assert_eq!(stack.resolve_all(), map(json!({"users": {"deploy": 3}})));
        assert!(stack.get("users/root").is_err());
        assert!(!stack.contains("users/root"));
        assert_eq!(stack.get_or("users/root", Value::from("absent")), Value::from("absent"));
        assert_eq!(stack.get("users/deploy").unwrap(), Value::Int(3));
    }

    #[test]
    fn get_or_skips_the_error_path() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "node:a", map(json!({"s": "x"}))).unwrap();
        assert_eq!(stack.get_or("s/inner", Value::Int(1)), Value::Int(1));
        assert_eq!(stack.get_or("s", Value::Int(1)), Value::from("x"));
    }

    #[test]
    fn merged_set_stays_storable() {
        let mut defaults = Map::new();
        defaults.insert("s".into(), Value::set([Value::Int(1)]));
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "defaults", defaults).unwrap();
        stack.set_layer(Layer::Static, "node:a", map(json!({"s": [{"a": 1}]}))).unwrap();

        let resolved = stack.resolve_all();
        assert_eq!(resolved["s"], Value::from(json!([{"a": 1}])));
        let mut again = Metastack::new();
        assert!(again.set_layer(Layer::Static, "node:a", resolved).is_ok());
    }

    #[test]
    fn get_matches_resolve_all() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "d", map(json!({"a": {"b": [1], "c": 1}}))).unwrap();
        stack.set_layer(Layer::Static, "g", map(json!({"a": {"b": [2]}}))).unwrap();
        stack.set_layer(Layer::Reactors, "r", map(json!({"a": {"c": 3}}))).unwrap();
        let all = stack.resolve_all();
        assert_eq!(Value::Map(all.clone()), stack.get("").unwrap());
        assert_eq!(stack.get("a").unwrap(), all["a"]);
        assert_eq!(stack.get("a/b").unwrap(), Value::from(json!([1, 2])));
    }

    #[test]
    fn returned_values_are_copies() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "n", map(json!({"a": {"b": 1}}))).unwrap();
        let mut copy = stack.get("a").unwrap();
        if let Value::Map(inner) = &mut copy {
            inner.insert("b".into(), Value::Int(99));
        }
        assert_eq!(stack.get("a/b").unwrap(), Value::Int(1));
    }

    #[test]
    fn cached_partitions_read_the_same() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Static, "g1", map(json!({"a": {"x": 1}}))).unwrap();
        stack.set_layer(Layer::Static, "g2", map(json!({"a": {"y": 2}}))).unwrap();
        let before = stack.resolve_all();
        stack.cache_partition(Layer::Static);
        assert_eq!(stack.resolve_all(), before);
        assert_eq!(stack.get("a/y").unwrap(), Value::Int(2));

        // Writes invalidate the cache.
        stack.set_layer(Layer::Static, "g2", map(json!({"a": {"y": 3}}))).unwrap();
        assert_eq!(stack.get("a/y").unwrap(), Value::Int(3));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut stack = Metastack::new();
        let mut bad = Map::new();
        bad.insert("f".into(), Value::Float(f64::NAN));
        assert!(matches!(
            stack.set_layer(Layer::Static, "n", bad),
            Err(Error::InvalidMetadata { .. })
        ));

        let mut nested = Map::new();
        let mut inner = Map::new();
        inner.insert("s".into(), Value::set([Value::List(vec![])]));
        nested.insert("outer".into(), Value::Map(inner));
        match stack.set_layer(Layer::Static, "n", nested) {
            Err(Error::InvalidMetadata { path, .. }) => assert_eq!(path.to_string(), "outer/s"),
            other => panic!("expected invalid metadata, got {other:?}"),
        }

        let mut atomic_scalar = Map::new();
        atomic_scalar.insert("a".into(), Value::Atomic(Box::new(Value::Int(1))));
        assert!(stack.set_layer(Layer::Static, "n", atomic_scalar).is_err());
        assert!(stack.sources().is_empty());
    }

    #[test]
    fn blame_tracks_surviving_sources() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "metadata_defaults:d", map(json!({"foo": "base", "list": [1], "keep": 1}))).unwrap();
        stack.set_layer(Layer::Static, "group:g", map(json!({"foo": "group", "list": [2]}))).unwrap();
        stack.set_layer(Layer::Reactors, "metadata_reactor:r", map(json!({"foo": "reactor", "nested": {"x": 1}}))).unwrap();

        let (merged, blame) = stack.resolve_with_blame();
        assert_eq!(merged, stack.resolve_all());
        assert_eq!(sources(&blame, "foo"), vec!["metadata_reactor:r"]);
        assert_eq!(sources(&blame, "list"), vec!["metadata_defaults:d", "group:g"]);
        assert_eq!(sources(&blame, "keep"), vec!["metadata_defaults:d"]);
        assert_eq!(sources(&blame, "nested/x"), vec!["metadata_reactor:r"]);
        assert!(!blame.contains_key(&KeyPath::from("nested")));
    }

    #[test]
    fn blame_forgets_replaced_subtrees() {
        let mut stack = Metastack::new();
        stack.set_layer(Layer::Defaults, "d", map(json!({"a": {"b": 1, "c": 2}}))).unwrap();
        let mut update = Map::new();
        update.insert("a".into(), Value::atomic(Value::from(json!({"z": 0}))));
        stack.set_layer(Layer::Static, "n", update).unwrap();

        let (_, blame) = stack.resolve_with_blame();
        assert_eq!(sources(&blame, "a"), vec!["n"]);
        assert!(!blame.contains_key(&KeyPath::from("a/b")));
    }
}
