//! Metadata values.
//!
//! A closed set of value kinds. Containers are plain owned data, so cloning
//! a value never shares mutable state between nodes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::FaultError;

/// A metadata mapping. Keys are always strings and iterate in sorted order.
pub type Map = BTreeMap<String, Value>;

/// A single metadata value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Opaque lazily-resolved value.
    Fault(Fault),
    Map(Map),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Set(BTreeSet<Value>),
    /// A container that replaces instead of merging.
    Atomic(Box<Value>),
}

impl Value {
    /// Mark a container as atomic. Scalars are returned unchanged since
    /// they never merge anyway.
    pub fn atomic(value: Value) -> Value {
        match value {
            Value::Map(_) | Value::List(_) | Value::Tuple(_) | Value::Set(_) => {
                Value::Atomic(Box::new(value))
            }
            other => other,
        }
    }

    /// Build a byte-string value.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(data.into())
    }

    /// Build a set value.
    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Set(items.into_iter().collect())
    }

    /// Build a tuple value.
    pub fn tuple<I: IntoIterator<Item = Value>>(items: I) -> Value {
        Value::Tuple(items.into_iter().collect())
    }

    /// Whether this value opts out of merging.
    pub fn is_atomic(&self) -> bool {
        matches!(self, Value::Atomic(_))
    }

    /// The value with any atomic marker removed.
    pub fn unmarked(&self) -> &Value {
        match self {
            Value::Atomic(inner) => inner,
            other => other,
        }
    }

    /// Short name of the value kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Fault(_) => "fault",
            Value::Map(_) => "map",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Set(_) => "set",
            Value::Atomic(_) => "atomic",
        }
    }

    /// Mapping contents, seeing through atomic markers.
    pub fn as_map(&self) -> Option<&Map> {
        match self.unmarked() {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Elements of a list, tuple or set (seeing through atomic markers).
    pub fn items(&self) -> Option<Box<dyn Iterator<Item = &Value> + '_>> {
        match self.unmarked() {
            Value::List(items) | Value::Tuple(items) => Some(Box::new(items.iter())),
            Value::Set(items) => Some(Box::new(items.iter())),
            _ => None,
        }
    }

    /// Whether the value may be stored inside a set.
    pub fn is_hashable(&self) -> bool {
        match self {
            Value::Map(_) | Value::List(_) | Value::Set(_) | Value::Atomic(_) => false,
            Value::Tuple(items) => items.iter().all(Value::is_hashable),
            Value::Float(f) => !f.is_nan(),
            _ => true,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::Fault(_) => 6,
            Value::Tuple(_) => 7,
            Value::List(_) => 8,
            Value::Set(_) => 9,
            Value::Map(_) => 10,
            Value::Atomic(_) => 11,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Fault(a), Value::Fault(b)) => a.id().cmp(b.id()),
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Set(a), Value::Set(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            (Value::Atomic(a), Value::Atomic(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string(&crate::json::Canonical::labelled(self))
            .map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeSet<Value>> for Value {
    fn from(items: BTreeSet<Value>) -> Self {
        Value::Set(items)
    }
}

impl From<Fault> for Value {
    fn from(fault: Fault) -> Self {
        Value::Fault(fault)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::MAX)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

type Resolver =
    dyn Fn() -> Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync;

/// An opaque value that is only computed when its content is needed.
///
/// Faults compare and order by identifier; the resolver is never invoked
/// for merging, copying or change detection. The first successful
/// resolution is memoised.
#[derive(Clone)]
pub struct Fault {
    inner: Arc<FaultInner>,
}

struct FaultInner {
    id: String,
    resolver: Box<Resolver>,
    resolved: OnceLock<Value>,
}

impl Fault {
    pub fn new<F>(id: impl Into<String>, resolver: F) -> Self
    where
        F: Fn() -> Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FaultInner {
                id: id.into(),
                resolver: Box::new(resolver),
                resolved: OnceLock::new(),
            }),
        }
    }

    /// A fault that resolves to a fixed value.
    pub fn fixed(id: impl Into<String>, value: Value) -> Self {
        Self::new(id, move || Ok(value.clone()))
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Resolve the underlying value.
    pub fn value(&self) -> Result<Value, FaultError> {
        if let Some(value) = self.inner.resolved.get() {
            return Ok(value.clone());
        }
        let value = (self.inner.resolver)().map_err(|e| FaultError {
            id: self.inner.id.clone(),
            message: e.to_string(),
        })?;
        Ok(self.inner.resolved.get_or_init(|| value).clone())
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fault({})", self.inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[test]
    fn from_json() {
        let value = Value::from(json!({"a": [1, "x", null], "b": 1.5}));
        let map = value.as_map().unwrap();
        assert_eq!(
            map["a"],
            Value::List(vec![Value::Int(1), Value::from("x"), Value::Null])
        );
        assert_eq!(map["b"], Value::Float(1.5));
    }

    #[test]
    fn atomic_only_wraps_containers() {
        assert!(Value::atomic(Value::from(json!({"a": 1}))).is_atomic());
        assert!(!Value::atomic(Value::Int(3)).is_atomic());
        // Already-atomic values are not wrapped twice.
        let nested = Value::atomic(Value::atomic(Value::List(vec![])));
        assert!(matches!(nested, Value::Atomic(ref inner) if !inner.is_atomic()));
    }

    #[test]
    fn atomic_map_is_still_readable() {
        let value = Value::atomic(Value::from(json!({"a": 1})));
        assert_eq!(value.as_map().unwrap()["a"], Value::Int(1));
    }

    #[test]
    fn ordering_across_kinds_is_total() {
        let mut values = vec![
            Value::from("b"),
            Value::Int(2),
            Value::Null,
            Value::from("a"),
            Value::Bool(true),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(2),
                Value::from("a"),
                Value::from("b"),
            ]
        );
    }

    #[test]
    fn hashable_kinds() {
        assert!(Value::Int(1).is_hashable());
        assert!(Value::tuple([Value::Int(1), Value::from("x")]).is_hashable());
        assert!(!Value::List(vec![]).is_hashable());
        assert!(!Value::tuple([Value::List(vec![])]).is_hashable());
        assert!(!Value::Float(f64::NAN).is_hashable());
    }

    #[test]
    fn faults_compare_by_id_without_resolving() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let a = Fault::new("secret", move || {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Value::from("hunter2"))
        });
        let b = Fault::fixed("secret", Value::from("other"));
        assert_eq!(Value::Fault(a.clone()), Value::Fault(b));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 0);

        assert_eq!(a.value().unwrap(), Value::from("hunter2"));
        assert_eq!(a.value().unwrap(), Value::from("hunter2"));
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn fault_errors_carry_id() {
        let fault = Fault::new("broken", || Err("no vault".into()));
        let err = fault.value().unwrap_err();
        assert_eq!(err.id, "broken");
        assert!(err.to_string().contains("no vault"));
    }
}
