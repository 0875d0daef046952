//! Fixpoint metadata generator.
//!
//! # Algorithm
//!
//! Resolving a node starts a fresh working set seeded with that node and
//! loops, doing one unit of work per iteration:
//!
//! 1. initialize one unvisited node: load defaults (shuffled), group and
//!    node metadata, then run all of its reactors once;
//! 2. otherwise re-run the cross-node reactors of one retriggered node;
//! 3. otherwise re-run same-node reactors of every unstable node;
//! 4. otherwise run cross-node reactors of every node in shuffled order.
//!
//! A pass of step 4 that changes nothing ends the loop. Every node touched
//! along the way is then cached, so later requests for it are plain reads.
//!
//! Any change on a node marks it unstable and queues the nodes that read
//! from it. Reactors that read a node not yet in the working set pull it
//! in as unvisited.
//!
//! # Concurrency
//!
//! Resolutions are serialised behind a single build lock. Completed nodes
//! live behind their own lock and are read without taking the build lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use stratum_metastack::{to_canonical_json, Blame, Layer, Map, Metastack};
use tracing::{debug, info, warn};

use crate::config::GeneratorConfig;
use crate::conflicts::check_for_metadata_conflicts;
use crate::context::{Progress, ResolveContext};
use crate::error::{Error, Result};
use crate::node::{defaults_source, group_source, node_source, reactor_source, Node, Repository};
use crate::reactor::{CompletedMap, ReactorOutcome, ReactorRunner};

/// Resolved metadata of one node.
#[derive(Debug)]
struct CompletedNode {
    metadata: Arc<Map>,
    stack: Metastack,
}

/// Computes and caches node metadata.
pub struct MetadataGenerator {
    repo: Arc<Repository>,
    config: GeneratorConfig,
    build_lock: Mutex<()>,
    completed: RwLock<HashMap<String, Arc<CompletedNode>>>,
}

impl MetadataGenerator {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self::with_config(repo, GeneratorConfig::default())
    }

    pub fn with_config(repo: Arc<Repository>, config: GeneratorConfig) -> Self {
        Self {
            repo,
            config,
            build_lock: Mutex::new(()),
            completed: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Fully resolved metadata of `node`.
    pub fn resolve(&self, node: &str, ctx: &ResolveContext) -> Result<Arc<Map>> {
        Ok(Arc::clone(&self.completed_node(node, ctx)?.metadata))
    }

    /// Fully resolved metadata of `node` with the sources of every leaf.
    pub fn resolve_with_blame(&self, node: &str, ctx: &ResolveContext) -> Result<(Map, Blame)> {
        Ok(self.completed_node(node, ctx)?.stack.resolve_with_blame())
    }

    /// blake3 hex digest of the canonical JSON of `node`'s metadata.
    pub fn hash(&self, node: &str, ctx: &ResolveContext) -> Result<String> {
        let metadata = self.resolve(node, ctx)?;
        let json = to_canonical_json(&metadata)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Resolve `node` and run the conflict validator on it.
    pub fn check_conflicts(&self, node: &str, ctx: &ResolveContext) -> Result<()> {
        let done = self.completed_node(node, ctx)?;
        let definition = self.repo.get_node(node)?;
        check_for_metadata_conflicts(&self.repo, &definition, &done.stack)
    }

    /// Whether `node` is already in the completed cache.
    pub fn is_resolved(&self, node: &str) -> bool {
        self.cached(node).is_some()
    }

    /// Drop every cached result.
    pub fn clear(&self) {
        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.completed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn cached(&self, node: &str) -> Option<Arc<CompletedNode>> {
        self.completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node)
            .cloned()
    }

    fn completed_node(&self, node: &str, ctx: &ResolveContext) -> Result<Arc<CompletedNode>> {
        if let Some(done) = self.cached(node) {
            return Ok(done);
        }
        let _guard = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = self.cached(node) {
            return Ok(done);
        }
        self.repo.get_node(node)?;

        let snapshot: CompletedMap = self
            .completed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, done)| (name.clone(), Arc::clone(&done.metadata)))
            .collect();
        let resolved = Resolution::new(&self.repo, &self.config, ctx, snapshot).run(node)?;

        let mut completed = self.completed.write().unwrap_or_else(PoisonError::into_inner);
        for (name, stack) in resolved {
            let metadata = Arc::new(stack.resolve_all());
            completed.insert(name, Arc::new(CompletedNode { metadata, stack }));
        }
        completed
            .get(node)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(node.to_owned()))
    }
}

impl std::fmt::Debug for MetadataGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataGenerator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Which reactors of a node to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    All,
    SameNode,
    CrossNode,
}

type ReactorKey = (String, String);

/// Working state of one top-level resolution.
struct Resolution<'a> {
    repo: &'a Repository,
    config: &'a GeneratorConfig,
    ctx: &'a ResolveContext,
    rng: StdRng,
    completed: CompletedMap,
    runner: ReactorRunner,
    metastacks: HashMap<String, Metastack>,
    nodes: HashMap<String, Arc<Node>>,
    dependents: HashMap<String, BTreeSet<String>>,
    cross_node: HashSet<ReactorKey>,
    stable: BTreeMap<String, bool>,
    unvisited: BTreeSet<String>,
    retrigger: BTreeSet<String>,
    initialized: BTreeSet<String>,
    changed_now: BTreeSet<ReactorKey>,
    last_changed: BTreeSet<ReactorKey>,
}

impl<'a> Resolution<'a> {
    fn new(
        repo: &'a Repository,
        config: &'a GeneratorConfig,
        ctx: &'a ResolveContext,
        completed: CompletedMap,
    ) -> Self {
        let seed = config.shuffle_seed.unwrap_or_else(|| rand::thread_rng().gen());
        debug!(seed, "metadata shuffle seed");
        Self {
            repo,
            config,
            ctx,
            rng: StdRng::seed_from_u64(seed),
            completed,
            runner: ReactorRunner::new(),
            metastacks: HashMap::new(),
            nodes: HashMap::new(),
            dependents: HashMap::new(),
            cross_node: HashSet::new(),
            stable: BTreeMap::new(),
            unvisited: BTreeSet::new(),
            retrigger: BTreeSet::new(),
            initialized: BTreeSet::new(),
            changed_now: BTreeSet::new(),
            last_changed: BTreeSet::new(),
        }
    }

    /// Drive `node` and everything it pulls in to a fixpoint.
    fn run(mut self, node: &str) -> Result<HashMap<String, Metastack>> {
        self.unvisited.insert(node.to_owned());
        let mut iterations = 0;

        loop {
            self.ctx.check()?;
            if iterations >= self.config.max_iterations {
                return Err(Error::NonTermination {
                    iterations,
                    reactors: self.last_changed.into_iter().collect(),
                });
            }
            iterations += 1;
            self.changed_now.clear();

            if let Some(next) = self.unvisited.pop_first() {
                self.initialize(&next)?;
            } else if let Some(next) = self.retrigger.pop_first() {
                self.run_reactors(&next, Pass::CrossNode)?;
            } else if self.stable.values().any(|stable| !stable) {
                self.restabilize()?;
            } else if !self.cross_node_pass()? {
                break;
            }

            if !self.changed_now.is_empty() {
                self.last_changed = std::mem::take(&mut self.changed_now);
            }
        }

        self.finish(node, iterations)
    }

    fn initialize(&mut self, name: &str) -> Result<()> {
        let node = self.repo.get_node(name)?;
        let mut stack = Metastack::new();

        let mut defaults: Vec<&(String, Map)> = node.defaults().iter().collect();
        defaults.shuffle(&mut self.rng);
        for (provider, map) in defaults {
            load(&mut stack, name, Layer::Defaults, defaults_source(provider), map)?;
        }
        for group in self.repo.group_order(&node)? {
            load(&mut stack, name, Layer::Static, group_source(group.name()), group.metadata())?;
        }
        load(&mut stack, name, Layer::Static, node_source(name), node.metadata())?;
        stack.cache_partition(Layer::Defaults);
        stack.cache_partition(Layer::Static);

        // Reserve reactor cells in declaration order so output folds the
        // same way regardless of which reactor first succeeds.
        for (reactor, _) in node.reactors() {
            load(&mut stack, name, Layer::Reactors, reactor_source(reactor), &Map::new())?;
        }

        debug!(node = name, groups = ?node.groups(), "initialized node metadata");
        self.metastacks.insert(name.to_owned(), stack);
        self.nodes.insert(name.to_owned(), node);
        self.initialized.insert(name.to_owned());
        self.stable.insert(name.to_owned(), false);
        self.ctx.report(Progress::NodeInitialized {
            node: name.to_owned(),
        });

        self.run_reactors(name, Pass::All)?;
        self.queue_dependents(name);
        Ok(())
    }

    fn restabilize(&mut self) -> Result<()> {
        let unstable: Vec<String> = self
            .stable
            .iter()
            .filter(|(_, stable)| !**stable)
            .map(|(name, _)| name.clone())
            .collect();
        for name in unstable {
            if !self.run_reactors(&name, Pass::SameNode)? {
                self.stable.insert(name, true);
            }
        }
        Ok(())
    }

    /// Returns whether the pass left more work behind.
    fn cross_node_pass(&mut self) -> Result<bool> {
        let mut order: Vec<String> = self.initialized.iter().cloned().collect();
        order.shuffle(&mut self.rng);
        let mut changed = false;
        for name in order {
            changed |= self.run_reactors(&name, Pass::CrossNode)?;
        }
        Ok(changed || !self.unvisited.is_empty() || !self.retrigger.is_empty())
    }

    /// Run the selected reactors of `name`. Returns whether any output changed.
    fn run_reactors(&mut self, name: &str, pass: Pass) -> Result<bool> {
        let node = self
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownNode(name.to_owned()))?;

        let mut changed = false;
        for (reactor_name, reactor) in node.reactors() {
            let key = (name.to_owned(), reactor_name.clone());
            let cross = self.cross_node.contains(&key);
            match pass {
                Pass::SameNode if cross => continue,
                Pass::CrossNode if !cross => continue,
                _ => {}
            }

            self.ctx.check()?;
            let run = self.runner.run(
                name,
                reactor_name,
                reactor,
                &mut self.metastacks,
                &self.completed,
            )?;
            self.record_access(&key, &run.accessed);

            if let ReactorOutcome::Ran { changed: ran_changed } = run.outcome {
                self.ctx.report(Progress::ReactorRan {
                    node: name.to_owned(),
                    reactor: reactor_name.clone(),
                    changed: ran_changed,
                });
                if ran_changed {
                    changed = true;
                    self.changed_now.insert(key);
                }
            }
        }

        if changed {
            self.stable.insert(name.to_owned(), false);
            self.queue_dependents(name);
        }
        Ok(changed)
    }

    fn record_access(&mut self, key: &ReactorKey, accessed: &BTreeSet<String>) {
        if accessed.is_empty() {
            return;
        }
        self.cross_node.insert(key.clone());
        for other in accessed {
            self.dependents
                .entry(other.clone())
                .or_default()
                .insert(key.0.clone());
            if !self.completed.contains_key(other) && !self.initialized.contains(other) {
                self.unvisited.insert(other.clone());
            }
        }
    }

    fn queue_dependents(&mut self, name: &str) {
        if let Some(dependents) = self.dependents.get(name) {
            self.retrigger
                .extend(dependents.iter().filter(|dep| *dep != name).cloned());
        }
    }

    fn finish(self, node: &str, iterations: usize) -> Result<HashMap<String, Metastack>> {
        let pending = self.runner.pending_errors();
        if !pending.is_empty() {
            for error in &pending {
                warn!(node = %error.node, reactor = %error.reactor, path = %error.error.path, "reactor never found its input");
            }
            return Err(Error::PersistentKeyError(pending));
        }

        if self.config.check_conflicts {
            for name in &self.initialized {
                if let (Some(definition), Some(stack)) = (self.nodes.get(name), self.metastacks.get(name)) {
                    check_for_metadata_conflicts(self.repo, definition, stack)?;
                }
            }
        }

        info!(node, iterations, nodes = self.initialized.len(), "metadata resolved");
        self.ctx.report(Progress::Finished { iterations });
        Ok(self.metastacks)
    }
}

fn load(stack: &mut Metastack, node: &str, layer: Layer, source_id: String, map: &Map) -> Result<()> {
    match stack.set_layer(layer, source_id.as_str(), map.clone()) {
        Ok(_) => Ok(()),
        Err(source) => Err(Error::InvalidNodeMetadata {
            node: node.to_owned(),
            source_id,
            source,
        }),
    }
}
