//! Error types for stratum-metastack.

use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::path::KeyPath;

/// Result type for metastack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while storing or reading metadata.
#[derive(Debug, Error)]
pub enum Error {
    /// A value of disallowed shape was offered to the store.
    #[error("invalid metadata at '{path}': {reason}")]
    InvalidMetadata { path: KeyPath, reason: String },

    /// Nothing is defined at the requested path.
    #[error(transparent)]
    KeyNotFound(#[from] KeyNotFound),

    /// A lazily-resolved value could not be resolved.
    #[error(transparent)]
    Fault(#[from] FaultError),

    /// Canonical serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A metadata lookup found nothing at `path`.
///
/// Carries the backtrace of the lookup so that errors which persist until
/// the end of a resolution can still point at the reactor code that
/// caused them.
#[derive(Clone, Error)]
#[error("{}", self.describe())]
pub struct KeyNotFound {
    /// The path that was requested.
    pub path: KeyPath,
    /// Node whose metadata was read, when known.
    pub node: Option<String>,
    backtrace: Arc<Backtrace>,
}

impl KeyNotFound {
    /// Create a not-found error for `path`.
    ///
    /// Captures a backtrace; lookups that tolerate a miss go through
    /// `find`/`get_or` and never build one.
    pub fn new(path: KeyPath) -> Self {
        Self {
            path,
            node: None,
            backtrace: Arc::new(Backtrace::capture()),
        }
    }

    /// Attach the name of the node whose metadata was read.
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Backtrace captured where the lookup failed.
    ///
    /// Only populated when `RUST_BACKTRACE` is set.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    fn describe(&self) -> String {
        match &self.node {
            Some(node) => format!("no metadata at '{}' on node {}", self.path, node),
            None => format!("no metadata at '{}'", self.path),
        }
    }
}

impl fmt::Debug for KeyNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyNotFound")
            .field("path", &self.path)
            .field("node", &self.node)
            .finish()
    }
}

impl PartialEq for KeyNotFound {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.node == other.node
    }
}

/// A [`Fault`](crate::Fault) resolver failed.
#[derive(Debug, Clone, Error)]
#[error("unable to resolve fault {id}: {message}")]
pub struct FaultError {
    /// Identifier of the fault.
    pub id: String,
    /// Message from the resolver.
    pub message: String,
}
