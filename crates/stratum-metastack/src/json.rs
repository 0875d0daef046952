//! Canonical JSON rendering of metadata.
//!
//! Mappings serialize with sorted keys, sets as sorted lists, byte strings
//! as lowercase hex and atomic markers are dropped. Faults either resolve
//! to their underlying value or, for display only, render as a label
//! without being resolved.

use serde::ser::{Error as _, Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::Result;
use crate::value::{Map, Value};

/// How faults are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Resolve and serialize the underlying value.
    Resolve,
    /// Render `<fault:ID>` without resolving.
    Label,
}

/// Serialize adapter producing the canonical form of a [`Value`].
#[derive(Debug, Clone, Copy)]
pub struct Canonical<'a> {
    value: &'a Value,
    mode: FaultMode,
}

impl<'a> Canonical<'a> {
    pub fn resolved(value: &'a Value) -> Self {
        Self {
            value,
            mode: FaultMode::Resolve,
        }
    }

    pub fn labelled(value: &'a Value) -> Self {
        Self {
            value,
            mode: FaultMode::Label,
        }
    }

    fn wrap(&self, value: &'a Value) -> Self {
        Self {
            value,
            mode: self.mode,
        }
    }
}

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.value {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            Value::Fault(fault) => match self.mode {
                FaultMode::Label => serializer.serialize_str(&format!("<fault:{}>", fault.id())),
                FaultMode::Resolve => {
                    let resolved = fault.value().map_err(S::Error::custom)?;
                    Canonical::resolved(&resolved).serialize(serializer)
                }
            },
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, &self.wrap(value))?;
                }
                out.end()
            }
            Value::List(items) | Value::Tuple(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&self.wrap(item))?;
                }
                out.end()
            }
            Value::Set(items) => {
                let mut out = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    out.serialize_element(&self.wrap(item))?;
                }
                out.end()
            }
            Value::Atomic(inner) => self.wrap(inner).serialize(serializer),
        }
    }
}

/// Compact canonical JSON with faults resolved. Used for hashing.
pub fn to_canonical_json(map: &Map) -> Result<String> {
    let value = Value::Map(map.clone());
    Ok(serde_json::to_string(&Canonical::resolved(&value))?)
}

/// Pretty JSON for display. Faults are labelled, never resolved.
pub fn to_display_json(map: &Map) -> Result<String> {
    let value = Value::Map(map.clone());
    Ok(serde_json::to_string_pretty(&Canonical::labelled(&value))?)
}
