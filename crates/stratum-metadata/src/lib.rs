//! Stratum Metadata
//!
//! Computes the metadata of managed nodes by layering defaults, group and
//! node metadata and the output of reactors, then re-running reactors until
//! nothing changes.
//!
//! # Reactors
//!
//! A [`Reactor`] is a function of a [`ReactorContext`] returning a
//! mapping. Reactors may read other nodes through
//! [`ReactorContext::partial`]; such reads are tracked and the reactor is
//! re-run whenever the other node changes.
//!
//! # Resolution
//!
//! [`MetadataGenerator`] drives all reactors of the requested node and of
//! every node it reads to a fixpoint and caches the results. Work is
//! bounded by [`GeneratorConfig::max_iterations`]; scheduling order is
//! shuffled with a seedable generator to surface order-dependent reactors.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use stratum_metadata::{MetadataGenerator, Node, Repository, ResolveContext, GeneratorConfig};
//! use stratum_metastack::{Map, Value};
//!
//! let mut repo = Repository::new();
//! repo.add_node(Node::new("web1").with_reactor("greeting", |ctx| {
//!     let mut out = Map::new();
//!     out.insert("hello".into(), Value::from(ctx.node_name()));
//!     Ok(out)
//! }));
//!
//! let config = GeneratorConfig::from_lookup(|_| None);
//! let generator = MetadataGenerator::with_config(Arc::new(repo), config);
//! let metadata = generator.resolve("web1", &ResolveContext::new()).unwrap();
//! assert_eq!(metadata["hello"], Value::from("web1"));
//! ```

mod config;
mod conflicts;
mod context;
mod error;
mod generator;
mod node;
mod reactor;

pub use config::{GeneratorConfig, DEFAULT_MAX_ITERATIONS};
pub use conflicts::{check_for_metadata_conflicts, check_group_conflicts, check_source_conflicts};
pub use context::{CancellationToken, Progress, ResolveContext};
pub use error::{Error, PendingKeyError, Result};
pub use generator::MetadataGenerator;
pub use node::{
    defaults_source, group_source, node_source, reactor_source, Group, Node, Repository,
    DEFAULTS_PREFIX, REACTOR_PREFIX,
};
pub use reactor::{PartialMetadata, Reactor, ReactorContext, ReactorError, ReactorOutcome, ReactorRun, ReactorRunner};
