//! Nodes, groups and the repository holding them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use stratum_metastack::Map;

use crate::error::{Error, Result};
use crate::reactor::{Reactor, ReactorContext, ReactorError};

/// Source identifier prefix for defaults providers.
pub const DEFAULTS_PREFIX: &str = "metadata_defaults:";
/// Source identifier prefix for reactor output.
pub const REACTOR_PREFIX: &str = "metadata_reactor:";

/// Source identifier of a defaults provider.
pub fn defaults_source(name: &str) -> String {
    format!("{DEFAULTS_PREFIX}{name}")
}

/// Source identifier of a reactor.
pub fn reactor_source(name: &str) -> String {
    format!("{REACTOR_PREFIX}{name}")
}

/// Source identifier of group metadata.
pub fn group_source(name: &str) -> String {
    format!("group:{name}")
}

/// Source identifier of a node's own metadata.
pub fn node_source(name: &str) -> String {
    format!("node:{name}")
}

/// A managed node.
#[derive(Clone, Default)]
pub struct Node {
    name: String,
    groups: Vec<String>,
    metadata: Map,
    defaults: Vec<(String, Map)>,
    reactors: Vec<(String, Reactor)>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a direct group membership.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    /// Set the node's own static metadata.
    pub fn with_metadata(mut self, metadata: Map) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add a named defaults provider.
    pub fn with_defaults(mut self, name: impl Into<String>, defaults: Map) -> Self {
        self.defaults.push((name.into(), defaults));
        self
    }

    /// Add a named reactor.
    pub fn with_reactor<F>(mut self, name: impl Into<String>, reactor: F) -> Self
    where
        F: Fn(&ReactorContext<'_>) -> std::result::Result<Map, ReactorError> + Send + Sync + 'static,
    {
        self.reactors.push((name.into(), Reactor::new(reactor)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct group memberships, in declaration order.
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn metadata(&self) -> &Map {
        &self.metadata
    }

    pub fn defaults(&self) -> &[(String, Map)] {
        &self.defaults
    }

    pub fn reactors(&self) -> &[(String, Reactor)] {
        &self.reactors
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .field("defaults", &self.defaults.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("reactors", &self.reactors.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

/// A named set of nodes sharing static metadata.
#[derive(Debug, Clone, Default)]
pub struct Group {
    name: String,
    metadata: Map,
    subgroups: Vec<String>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Map) -> Self {
        self.metadata = metadata;
        self
    }

    /// Members of `subgroup` are implicitly members of this group.
    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroups.push(subgroup.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &Map {
        &self.metadata
    }

    pub fn subgroups(&self) -> &[String] {
        &self.subgroups
    }
}

/// In-memory registry of nodes and groups.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    nodes: BTreeMap<String, Arc<Node>>,
    groups: BTreeMap<String, Arc<Group>>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node.
    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.name.clone(), Arc::new(node));
    }

    /// Add or replace a group.
    pub fn add_group(&mut self, group: Group) {
        self.groups.insert(group.name.clone(), Arc::new(group));
    }

    pub fn get_node(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(name.to_owned()))
    }

    pub fn get_group(&self, name: &str) -> Result<Arc<Group>> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownGroup(name.to_owned()))
    }

    /// Names of all nodes, sorted.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Effective group membership of `node`: its direct groups plus every
    /// group that has one of them as a (transitive) subgroup.
    pub fn node_groups(&self, node: &Node) -> Result<BTreeSet<String>> {
        let mut members = BTreeSet::new();
        let mut pending: Vec<String> = node.groups.clone();
        while let Some(name) = pending.pop() {
            if !members.insert(name.clone()) {
                continue;
            }
            self.get_group(&name)?;
            for parent in self.parents_of(&name) {
                if !members.contains(parent) {
                    pending.push(parent.to_owned());
                }
            }
        }
        Ok(members)
    }

    /// Groups of `node` ordered so every group comes after its parents.
    ///
    /// Among groups whose parents are all placed, the one reached from the
    /// earliest declared membership comes first, then names sort.
    pub fn group_order(&self, node: &Node) -> Result<Vec<Arc<Group>>> {
        let members = self.node_groups(node)?;
        let mut rank: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, declared) in node.groups.iter().enumerate() {
            let mut pending = vec![declared.as_str()];
            while let Some(name) = pending.pop() {
                if rank.get(name).is_some_and(|seen| *seen <= index) {
                    continue;
                }
                rank.insert(name, index);
                pending.extend(self.parents_of(name));
            }
        }

        let mut parents: BTreeMap<&str, BTreeSet<&str>> = members
            .iter()
            .map(|name| {
                let within: BTreeSet<&str> = self
                    .parents_of(name)
                    .filter(|parent| members.contains(*parent))
                    .collect();
                (name.as_str(), within)
            })
            .collect();

        let mut order = Vec::with_capacity(members.len());
        while !parents.is_empty() {
            let Some(next) = parents
                .iter()
                .filter(|(_, pending)| pending.is_empty())
                .map(|(name, _)| *name)
                .min_by_key(|name| (rank.get(name).copied().unwrap_or(usize::MAX), *name))
            else {
                return Err(Error::GroupLoop(
                    parents.keys().map(|name| (*name).to_owned()).collect(),
                ));
            };
            parents.remove(next);
            for pending in parents.values_mut() {
                pending.remove(next);
            }
            order.push(self.get_group(next)?);
        }
        Ok(order)
    }

    /// Groups listing `name` as a subgroup.
    pub(crate) fn parents_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.groups
            .values()
            .filter(move |group| group.subgroups.iter().any(|sub| sub == name))
            .map(|group| group.name.as_str())
    }

    /// Subgroups of `name` that are also in `within`.
    pub(crate) fn children_within<'a>(
        &'a self,
        name: &str,
        within: &'a BTreeSet<String>,
    ) -> Vec<&'a str> {
        let Some(group) = self.groups.get(name) else {
            return Vec::new();
        };
        let mut children: Vec<&str> = group
            .subgroups
            .iter()
            .filter(|sub| within.contains(*sub))
            .map(String::as_str)
            .collect();
        children.sort_unstable();
        children.dedup();
        children
    }
}
