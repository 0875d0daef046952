//! Deep merge of metadata structures.
//!
//! `update` takes precedence over `base`. Mappings merge key by key,
//! sequences concatenate (base first), sets take the union of hashable
//! elements (a sequence holding anything else replaces the set). Anything else,
//! and anything marked atomic on either side, is replaced by `update`.
//! Inputs are never modified; the result shares no data with them.

use crate::value::{Map, Value};

/// Merge two mappings.
pub fn merge_dict(base: &Map, update: &Map) -> Map {
    let mut merged = base.clone();
    for (key, value) in update {
        let next = match base.get(key) {
            Some(existing) => merge_value(existing, value),
            None => value.clone(),
        };
        merged.insert(key.clone(), next);
    }
    merged
}

/// Merge two arbitrary values.
pub fn merge_value(base: &Value, update: &Value) -> Value {
    if base.is_atomic() || update.is_atomic() {
        return update.clone();
    }
    match (base, update) {
        (Value::Map(base), Value::Map(update)) => Value::Map(merge_dict(base, update)),
        (Value::List(items), _) if is_sequence(update) => {
            Value::List(concat(items.iter(), update))
        }
        (Value::Tuple(items), _) if is_sequence(update) => {
            Value::Tuple(concat(items.iter(), update))
        }
        (Value::Set(items), _) if unions_with(update) => {
            let mut union = items.clone();
            union.extend(update.items().into_iter().flatten().cloned());
            Value::Set(union)
        }
        _ => update.clone(),
    }
}

/// Whether `base` and `update` combine instead of `update` replacing `base`.
pub fn merges_with(base: &Value, update: &Value) -> bool {
    if base.is_atomic() || update.is_atomic() {
        return false;
    }
    match base {
        Value::Map(_) => matches!(update, Value::Map(_)),
        Value::List(_) | Value::Tuple(_) => is_sequence(update),
        Value::Set(_) => unions_with(update),
        _ => false,
    }
}

fn is_sequence(value: &Value) -> bool {
    matches!(value, Value::List(_) | Value::Tuple(_) | Value::Set(_))
}

/// A set only absorbs sequences whose elements it can hold.
fn unions_with(update: &Value) -> bool {
    is_sequence(update) && update.items().into_iter().flatten().all(Value::is_hashable)
}

fn concat<'a>(head: impl Iterator<Item = &'a Value>, tail: &'a Value) -> Vec<Value> {
    head.chain(tail.items().into_iter().flatten())
        .cloned()
        .collect()
}
