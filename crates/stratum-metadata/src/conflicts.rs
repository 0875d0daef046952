//! Static detection of ambiguous metadata.
//!
//! Within a layer the later source wins, which is only well defined when
//! the sources have a natural order. Two unrelated groups, two defaults
//! providers or two reactors setting the same scalar have none, so such
//! clashes are reported instead.

use std::collections::BTreeSet;

use stratum_metastack::{map_dict_keys, merge_dict, value_at_key_path, Layer, Map, Metastack, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::node::{Node, Repository, DEFAULTS_PREFIX, REACTOR_PREFIX};

/// Run every conflict check for `node`.
pub fn check_for_metadata_conflicts(repo: &Repository, node: &Node, stack: &Metastack) -> Result<()> {
    check_group_conflicts(repo, node)?;
    check_source_conflicts(node.name(), stack)
}

/// Reject key paths set differently by group chains that share no group.
///
/// A chain is one path through the subgroup hierarchy from a group without
/// parents down to a group without children, restricted to the node's
/// effective groups.
pub fn check_group_conflicts(repo: &Repository, node: &Node) -> Result<()> {
    let chains = group_chains(repo, node)?;
    let merged: Vec<Map> = chains
        .iter()
        .map(|chain| {
            chain.iter().try_fold(Map::new(), |acc, name| {
                Ok::<_, Error>(merge_dict(&acc, repo.get_group(name)?.metadata()))
            })
        })
        .collect::<Result<_>>()?;

    for (i, chain_a) in chains.iter().enumerate() {
        for (j, chain_b) in chains.iter().enumerate().skip(i + 1) {
            if chain_a.iter().any(|group| chain_b.contains(group)) {
                continue;
            }
            let (meta_a, meta_b) = (&merged[i], &merged[j]);
            for path in map_dict_keys(meta_a) {
                let (Some(a), Some(b)) = (value_at_key_path(meta_a, &path), value_at_key_path(meta_b, &path)) else {
                    continue;
                };
                if a != b && !combinable(a, b) {
                    return Err(Error::GroupConflict {
                        path: path.to_string(),
                        chain_a: chain_a.clone(),
                        chain_b: chain_b.clone(),
                    });
                }
            }
        }
    }
    debug!(node = node.name(), chains = chains.len(), "no group conflicts");
    Ok(())
}

/// Reject key paths set by two defaults providers or by two reactors.
pub fn check_source_conflicts(node: &str, stack: &Metastack) -> Result<()> {
    for (layer, prefix) in [(Layer::Defaults, DEFAULTS_PREFIX), (Layer::Reactors, REACTOR_PREFIX)] {
        let cells: Vec<(&str, &Map)> = stack
            .layer_cells(layer)
            .filter(|(source, _)| source.starts_with(prefix))
            .collect();

        for (i, (source_a, map_a)) in cells.iter().enumerate() {
            for (source_b, map_b) in cells.iter().skip(i + 1) {
                for path in map_dict_keys(map_a) {
                    let (Some(a), Some(b)) = (value_at_key_path(map_a, &path), value_at_key_path(map_b, &path)) else {
                        continue;
                    };
                    if !combinable(a, b) {
                        return Err(Error::SourceConflict {
                            node: node.to_owned(),
                            path: path.to_string(),
                            source_a: (*source_a).to_owned(),
                            value_a: a.to_string(),
                            source_b: (*source_b).to_owned(),
                            value_b: b.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

/// Both mappings or both sets: these merge without a winner.
fn combinable(a: &Value, b: &Value) -> bool {
    matches!(
        (a.unmarked(), b.unmarked()),
        (Value::Map(_), Value::Map(_)) | (Value::Set(_), Value::Set(_))
    )
}

/// Root-to-leaf chains over the effective groups of `node`, sorted.
fn group_chains(repo: &Repository, node: &Node) -> Result<Vec<Vec<String>>> {
    let members = repo.node_groups(node)?;
    let roots: Vec<&String> = members
        .iter()
        .filter(|name| !repo.parents_of(name).any(|parent| members.contains(parent)))
        .collect();

    let mut chains = Vec::new();
    for root in roots {
        let mut path = vec![root.clone()];
        walk(repo, &members, &mut path, &mut chains)?;
    }
    chains.sort();
    Ok(chains)
}

fn walk(repo: &Repository, members: &BTreeSet<String>, path: &mut Vec<String>, chains: &mut Vec<Vec<String>>) -> Result<()> {
    let Some(current) = path.last().cloned() else {
        return Ok(());
    };
    let children = repo.children_within(&current, members);
    if children.is_empty() {
        chains.push(path.clone());
        return Ok(());
    }
    for child in children {
        if path.iter().any(|seen| seen == child) {
            return Err(Error::GroupLoop(path.clone()));
        }
        path.push(child.to_owned());
        walk(repo, members, path, chains)?;
        path.pop();
    }
    Ok(())
}
