//! Stratum Metastack
//!
//! Layered metadata storage for a single node.
//!
//! # Values
//!
//! Metadata is a tree of [`Value`]s rooted in a string-keyed [`Map`].
//! Containers are owned data; a [`Fault`] is an opaque value that is only
//! resolved when its content is serialized.
//!
//! # Merging
//!
//! [`merge_dict`] combines two mappings: mappings merge key-wise,
//! sequences concatenate, sets union and everything else is replaced.
//! Values wrapped with [`Value::atomic`] always replace.
//!
//! # Layers
//!
//! A [`Metastack`] holds the contributions of many sources in three
//! priority bands (see [`Layer`]) and answers merged reads, optionally
//! with [`Blame`] attributing every leaf to its sources.

mod error;
mod json;
mod merge;
mod metastack;
mod path;
mod value;

pub use error::{Error, FaultError, KeyNotFound, Result};
pub use json::{to_canonical_json, to_display_json, Canonical, FaultMode};
pub use merge::{merge_dict, merge_value, merges_with};
pub use metastack::{Blame, Layer, Metastack};
pub use path::{map_dict_keys, value_at_key_path, KeyPath};
pub use value::{Fault, Map, Value};
