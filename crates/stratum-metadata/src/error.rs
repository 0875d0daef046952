//! Error types for stratum-metadata.

use std::fmt;

use stratum_metastack::KeyNotFound;
use thiserror::Error;

/// Result type for metadata resolution.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving node metadata.
#[derive(Debug, Error)]
pub enum Error {
    /// No node with this name exists in the repository.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// No group with this name exists in the repository.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// Subgroup relations form a cycle.
    #[error("subgroup loop between groups: {}", .0.join(", "))]
    GroupLoop(Vec<String>),

    /// Static metadata of a node, group or defaults provider is invalid.
    #[error("invalid metadata from {source_id} on node {node}: {source}")]
    InvalidNodeMetadata {
        node: String,
        source_id: String,
        source: stratum_metastack::Error,
    },

    /// A reactor returned a value that cannot be stored.
    #[error("metadata reactor {reactor} on node {node} returned invalid metadata: {source}")]
    InvalidReactorOutput {
        node: String,
        reactor: String,
        source: stratum_metastack::Error,
    },

    /// A reactor failed with an error other than a missing key.
    #[error("metadata reactor {reactor} on node {node} failed: {source}")]
    ReactorFailed {
        node: String,
        reactor: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Reactors still could not find the keys they need once every other
    /// reactor had settled.
    #[error("{}", PersistentKeyErrors(.0))]
    PersistentKeyError(Vec<PendingKeyError>),

    /// The iteration cap was reached before metadata settled.
    #[error(
        "metadata did not settle after {iterations} iterations, last changed reactors: {}",
        .reactors.iter().map(|(n, r)| format!("{n}: {r}")).collect::<Vec<_>>().join(", ")
    )]
    NonTermination {
        iterations: usize,
        reactors: Vec<(String, String)>,
    },

    /// Two unrelated groups define incompatible values at the same path.
    #[error("conflicting metadata at '{path}' between group chains [{}] and [{}]", .chain_a.join(" > "), .chain_b.join(" > "))]
    GroupConflict {
        path: String,
        chain_a: Vec<String>,
        chain_b: Vec<String>,
    },

    /// Two sources of the same kind define incompatible values at the same path.
    #[error("conflicting metadata at '{path}' on node {node}: {source_a} sets {value_a}, {source_b} sets {value_b}")]
    SourceConflict {
        node: String,
        path: String,
        source_a: String,
        value_a: String,
        source_b: String,
        value_b: String,
    },

    /// Resolution was abandoned because the context was cancelled.
    #[error("metadata resolution cancelled")]
    Cancelled,

    /// Serializing or reading metadata failed.
    #[error(transparent)]
    Metastack(#[from] stratum_metastack::Error),
}

/// A reactor whose last run ended in a missing key.
#[derive(Debug, Clone)]
pub struct PendingKeyError {
    pub node: String,
    pub reactor: String,
    pub error: KeyNotFound,
}

impl fmt::Display for PendingKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.node, self.reactor, self.error)?;
        let backtrace = self.error.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            write!(f, "\n{backtrace}")?;
        }
        Ok(())
    }
}

struct PersistentKeyErrors<'a>(&'a [PendingKeyError]);

impl fmt::Display for PersistentKeyErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "metadata reactors raised missing keys that never appeared:")?;
        for pending in self.0 {
            write!(f, "\n  {pending}")?;
        }
        Ok(())
    }
}
