//! Shared fixtures for the scenario tests under `tests/`.

use std::sync::Arc;

use stratum_metadata::{GeneratorConfig, Group, MetadataGenerator, Node, Repository};
use stratum_metastack::{Map, Value};

/// Convert a JSON object literal into a metadata mapping.
///
/// # Panics
///
/// Panics when `value` is not a JSON object.
pub fn map(value: serde_json::Value) -> Map {
    match Value::from(value) {
        Value::Map(map) => map,
        other => panic!("not a mapping: {other}"),
    }
}

/// Configuration that ignores the environment.
pub fn config(seed: u64) -> GeneratorConfig {
    GeneratorConfig::from_lookup(|_| None).with_seed(seed)
}

/// Build a repository from nodes and groups.
pub fn repository(nodes: Vec<Node>, groups: Vec<Group>) -> Arc<Repository> {
    stratum_logging::init_for_tests();
    let mut repo = Repository::new();
    for node in nodes {
        repo.add_node(node);
    }
    for group in groups {
        repo.add_group(group);
    }
    Arc::new(repo)
}

/// Generator over `repo` with a fixed shuffle seed.
pub fn generator(repo: &Arc<Repository>, seed: u64) -> MetadataGenerator {
    MetadataGenerator::with_config(Arc::clone(repo), config(seed))
}
