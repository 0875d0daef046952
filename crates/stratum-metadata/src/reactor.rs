//! Metadata reactors and the wrapper that runs them.
//!
//! A reactor reads the partial metadata of its node (and possibly of other
//! nodes) and returns a mapping that becomes its contribution to the
//! reactor layer. Its result is one of:
//!
//! - `Ok(map)`: the current output;
//! - [`ReactorError::KeyNotFound`]: an input is missing, try again later;
//! - [`ReactorError::DoNotRunAgain`]: keep the last output forever;
//! - [`ReactorError::Failed`]: a bug in the reactor, resolution aborts.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use stratum_metastack::{KeyNotFound, KeyPath, Layer, Map, Metastack, Value};
use thiserror::Error;
use tracing::trace;

use crate::error::{Error, PendingKeyError, Result};
use crate::node::reactor_source;

type ReactorFn =
    dyn Fn(&ReactorContext<'_>) -> std::result::Result<Map, ReactorError> + Send + Sync;

/// A metadata reactor function.
#[derive(Clone)]
pub struct Reactor(Arc<ReactorFn>);

impl Reactor {
    pub fn new<F>(reactor: F) -> Self
    where
        F: Fn(&ReactorContext<'_>) -> std::result::Result<Map, ReactorError> + Send + Sync + 'static,
    {
        Self(Arc::new(reactor))
    }

    pub fn call(&self, ctx: &ReactorContext<'_>) -> std::result::Result<Map, ReactorError> {
        (self.0)(ctx)
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reactor")
    }
}

/// Ways a reactor can decline to produce output.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// An input is not available yet.
    #[error(transparent)]
    KeyNotFound(#[from] KeyNotFound),

    /// Freeze the reactor at its last successful output.
    #[error("reactor asked not to be run again")]
    DoNotRunAgain,

    /// Anything else. Aborts resolution.
    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl ReactorError {
    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ReactorError::Failed(error.into())
    }
}

/// Completed metadata of a node, shared with reactors of later resolutions.
pub(crate) type CompletedMap = HashMap<String, Arc<Map>>;

/// Read access handed to a reactor while it runs.
///
/// Reads of other nodes are recorded so the generator can re-run the
/// reactor when those nodes change.
pub struct ReactorContext<'a> {
    node: &'a str,
    metastacks: &'a HashMap<String, Metastack>,
    completed: &'a CompletedMap,
    accessed: RefCell<BTreeSet<String>>,
}

impl<'a> ReactorContext<'a> {
    pub(crate) fn new(
        node: &'a str,
        metastacks: &'a HashMap<String, Metastack>,
        completed: &'a CompletedMap,
    ) -> Self {
        Self {
            node,
            metastacks,
            completed,
            accessed: RefCell::new(BTreeSet::new()),
        }
    }

    /// Name of the node this reactor belongs to.
    pub fn node_name(&self) -> &str {
        self.node
    }

    /// Current metadata of this node at `path`.
    pub fn get(&self, path: impl Into<KeyPath>) -> std::result::Result<Value, KeyNotFound> {
        self.partial(self.node).get(path)
    }

    /// Current metadata of this node at `path`, or `default`.
    pub fn get_or(&self, path: impl Into<KeyPath>, default: Value) -> Value {
        self.partial(self.node).get_or(path, default)
    }

    /// Live view of another node's metadata.
    ///
    /// The view reflects whatever has been resolved so far and may gain
    /// data in later passes; missing paths are not final.
    pub fn partial(&self, node: &str) -> PartialMetadata<'a> {
        if node != self.node {
            self.accessed.borrow_mut().insert(node.to_owned());
        }
        let source = match self.completed.get(node) {
            Some(map) => Source::Complete(map),
            None => match self.metastacks.get(node) {
                Some(stack) => Source::Live(stack),
                None => Source::Pending,
            },
        };
        PartialMetadata {
            node: node.to_owned(),
            source,
        }
    }

    fn into_accessed(self) -> BTreeSet<String> {
        self.accessed.into_inner()
    }
}

enum Source<'a> {
    Complete(&'a Map),
    Live(&'a Metastack),
    Pending,
}

/// A read-only view of one node's metadata during resolution.
pub struct PartialMetadata<'a> {
    node: String,
    source: Source<'a>,
}

impl PartialMetadata<'_> {
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Value at `path`. A miss captures a backtrace at the caller's read.
    pub fn get(&self, path: impl Into<KeyPath>) -> std::result::Result<Value, KeyNotFound> {
        let path = path.into();
        self.find(&path)
            .ok_or_else(|| KeyNotFound::new(path).on_node(self.node.clone()))
    }

    pub fn get_or(&self, path: impl Into<KeyPath>, default: Value) -> Value {
        self.find(&path.into()).unwrap_or(default)
    }

    fn find(&self, path: &KeyPath) -> Option<Value> {
        match &self.source {
            Source::Live(stack) => stack.find(path),
            Source::Complete(map) if path.is_root() => Some(Value::Map((*map).clone())),
            Source::Complete(map) => stratum_metastack::value_at_key_path(map, path).cloned(),
            Source::Pending => None,
        }
    }
}

/// What happened when a reactor was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorOutcome {
    /// The reactor returned output; `changed` tells whether it differs
    /// from its previous output.
    Ran { changed: bool },
    /// An input was missing; the reactor will be retried.
    Deferred,
    /// The reactor asked not to be run again.
    Frozen,
    /// The reactor is frozen and was not invoked.
    Skipped,
}

/// Result of one reactor invocation.
#[derive(Debug, Clone)]
pub struct ReactorRun {
    pub outcome: ReactorOutcome,
    /// Other nodes whose metadata the reactor read.
    pub accessed: BTreeSet<String>,
}

impl ReactorRun {
    pub fn changed(&self) -> bool {
        matches!(self.outcome, ReactorOutcome::Ran { changed: true })
    }

    fn idle(outcome: ReactorOutcome) -> Self {
        Self {
            outcome,
            accessed: BTreeSet::new(),
        }
    }
}

type ReactorKey = (String, String);

/// Runs reactors and keeps the per-reactor bookkeeping of one resolution.
#[derive(Debug, Default)]
pub struct ReactorRunner {
    frozen: HashSet<ReactorKey>,
    pending: BTreeMap<ReactorKey, KeyNotFound>,
}

impl ReactorRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `reactor` for `node` and store its output in the node's
    /// metastack.
    pub(crate) fn run(
        &mut self,
        node: &str,
        name: &str,
        reactor: &Reactor,
        metastacks: &mut HashMap<String, Metastack>,
        completed: &CompletedMap,
    ) -> Result<ReactorRun> {
        let key = (node.to_owned(), name.to_owned());
        if self.frozen.contains(&key) {
            return Ok(ReactorRun::idle(ReactorOutcome::Skipped));
        }

        let ctx = ReactorContext::new(node, metastacks, completed);
        let result = reactor.call(&ctx);
        let accessed = ctx.into_accessed();

        match result {
            Ok(output) => {
                self.pending.remove(&key);
                let stack = metastacks
                    .get_mut(node)
                    .ok_or_else(|| Error::UnknownNode(node.to_owned()))?;
                let changed = stack
                    .set_layer(Layer::Reactors, reactor_source(name), output)
                    .map_err(|source| Error::InvalidReactorOutput {
                        node: node.to_owned(),
                        reactor: name.to_owned(),
                        source,
                    })?;
                trace!(node, reactor = name, changed, "reactor ran");
                Ok(ReactorRun {
                    outcome: ReactorOutcome::Ran { changed },
                    accessed,
                })
            }
            Err(ReactorError::KeyNotFound(missing)) => {
                trace!(node, reactor = name, %missing, "reactor deferred");
                self.pending.insert(key, missing);
                Ok(ReactorRun {
                    outcome: ReactorOutcome::Deferred,
                    accessed,
                })
            }
            Err(ReactorError::DoNotRunAgain) => {
                trace!(node, reactor = name, "reactor frozen");
                self.pending.remove(&key);
                self.frozen.insert(key);
                Ok(ReactorRun::idle(ReactorOutcome::Frozen))
            }
            Err(ReactorError::Failed(source)) => Err(Error::ReactorFailed {
                node: node.to_owned(),
                reactor: name.to_owned(),
                source,
            }),
        }
    }

    /// Whether `(node, reactor)` asked not to be run again.
    pub fn is_frozen(&self, node: &str, reactor: &str) -> bool {
        self.frozen.contains(&(node.to_owned(), reactor.to_owned()))
    }

    /// Missing-key errors from the most recent run of each reactor.
    pub fn pending_errors(&self) -> Vec<PendingKeyError> {
        self.pending
            .iter()
            .map(|((node, reactor), error)| PendingKeyError {
                node: node.clone(),
                reactor: reactor.clone(),
                error: error.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> Map {
        match Value::from(value) {
            Value::Map(map) => map,
            other => panic!("not a mapping: {other}"),
        }
    }

    fn stacks(nodes: &[(&str, serde_json::Value)]) -> HashMap<String, Metastack> {
        nodes
            .iter()
            .map(|(name, metadata)| {
                let mut stack = Metastack::new();
                stack
                    .set_layer(Layer::Static, format!("node:{name}"), map(metadata.clone()))
                    .unwrap();
                ((*name).to_owned(), stack)
            })
            .collect()
    }

    #[test]
    fn output_is_stored_and_change_reported() {
        let mut metastacks = stacks(&[("a", json!({"x": 1}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|ctx| {
            let x = ctx.get("x")?.as_int().unwrap_or(0);
            Ok(map(json!({"y": x + 1})))
        });

        let run = runner.run("a", "inc", &reactor, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Ran { changed: true });
        assert!(run.accessed.is_empty());
        assert_eq!(metastacks["a"].get("y").unwrap(), Value::Int(2));

        let run = runner.run("a", "inc", &reactor, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Ran { changed: false });
    }

    #[test]
    fn cross_node_reads_are_recorded() {
        let mut metastacks = stacks(&[("a", json!({})), ("b", json!({"ip": "10.0.0.2"}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|ctx| {
            let own = ctx.partial("a").get_or("missing", Value::Null);
            let ip = ctx.partial("b").get("ip")?;
            let _ = ctx.partial("c").get_or("ip", Value::Null);
            Ok(map(json!({"peer": ip.as_str(), "own": own.as_str()})))
        });

        let run = runner.run("a", "peer", &reactor, &mut metastacks, &completed).unwrap();
        assert!(run.changed());
        assert_eq!(
            run.accessed.into_iter().collect::<Vec<_>>(),
            vec!["b".to_owned(), "c".to_owned()]
        );
        assert_eq!(metastacks["a"].get("peer").unwrap(), Value::from("10.0.0.2"));
    }

    #[test]
    fn missing_keys_defer_and_clear() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|ctx| {
            let v = ctx.get("input")?;
            Ok(map(json!({"output": v.as_int()})))
        });

        let run = runner.run("a", "r", &reactor, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Deferred);
        let pending = runner.pending_errors();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].error.path, KeyPath::from("input"));

        metastacks
            .get_mut("a")
            .unwrap()
            .set_layer(Layer::Static, "node:a", map(json!({"input": 4})))
            .unwrap();
        let run = runner.run("a", "r", &reactor, &mut metastacks, &completed).unwrap();
        assert!(run.changed());
        assert!(runner.pending_errors().is_empty());
    }

    #[test]
    fn missing_keys_on_other_nodes_name_the_node() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|ctx| {
            ctx.partial("b").get("ip")?;
            Ok(Map::new())
        });

        let run = runner.run("a", "r", &reactor, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Deferred);
        assert!(run.accessed.contains("b"));
        assert_eq!(runner.pending_errors()[0].error.node.as_deref(), Some("b"));
    }

    #[test]
    fn do_not_run_again_freezes() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();

        let missing = Reactor::new(|ctx| {
            ctx.get("nope")?;
            Ok(Map::new())
        });
        runner.run("a", "r", &missing, &mut metastacks, &completed).unwrap();
        assert_eq!(runner.pending_errors().len(), 1);

        let stop = Reactor::new(|_| Err(ReactorError::DoNotRunAgain));
        let run = runner.run("a", "r", &stop, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Frozen);
        assert!(runner.pending_errors().is_empty());
        assert!(runner.is_frozen("a", "r"));

        let run = runner.run("a", "r", &missing, &mut metastacks, &completed).unwrap();
        assert_eq!(run.outcome, ReactorOutcome::Skipped);
        assert!(runner.pending_errors().is_empty());
    }

    #[test]
    fn failures_carry_context() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|_| Err(ReactorError::failed("boom")));

        match runner.run("a", "broken", &reactor, &mut metastacks, &completed) {
            Err(Error::ReactorFailed { node, reactor, source }) => {
                assert_eq!(node, "a");
                assert_eq!(reactor, "broken");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn invalid_output_carries_context() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let completed = CompletedMap::new();
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|_| {
            let mut out = Map::new();
            out.insert("bad".into(), Value::Float(f64::NAN));
            Ok(out)
        });

        assert!(matches!(
            runner.run("a", "nan", &reactor, &mut metastacks, &completed),
            Err(Error::InvalidReactorOutput { .. })
        ));
    }

    #[test]
    fn get_or_falls_back_on_every_source() {
        let metastacks = stacks(&[("a", json!({"x": 1})), ("b", json!({"y": "b"}))]);
        let mut completed = CompletedMap::new();
        completed.insert("c".into(), Arc::new(map(json!({"z": true}))));
        let ctx = ReactorContext::new("a", &metastacks, &completed);

        assert_eq!(ctx.get_or("x", Value::Null), Value::Int(1));
        assert_eq!(ctx.get_or("x/deeper", Value::Int(0)), Value::Int(0));
        assert_eq!(ctx.partial("b").get_or("y", Value::Null), Value::from("b"));
        assert_eq!(ctx.partial("b").get_or("nope", Value::Int(2)), Value::Int(2));
        assert_eq!(ctx.partial("c").get_or("z", Value::Null), Value::Bool(true));
        assert_eq!(ctx.partial("c").get_or("nope", Value::Int(3)), Value::Int(3));
        assert_eq!(ctx.partial("d").get_or("any", Value::Int(4)), Value::Int(4));
        assert!(ctx.partial("d").get("any").is_err());
        assert_eq!(
            ctx.into_accessed().into_iter().collect::<Vec<_>>(),
            vec!["b".to_owned(), "c".to_owned(), "d".to_owned()]
        );
    }

    #[test]
    fn completed_nodes_are_read_directly() {
        let mut metastacks = stacks(&[("a", json!({}))]);
        let mut completed = CompletedMap::new();
        completed.insert("b".into(), Arc::new(map(json!({"ip": "10.0.0.9"}))));
        let mut runner = ReactorRunner::new();
        let reactor = Reactor::new(|ctx| {
            let ip = ctx.partial("b").get("ip")?;
            Ok(map(json!({"peer": ip.as_str()})))
        });

        let run = runner.run("a", "peer", &reactor, &mut metastacks, &completed).unwrap();
        assert!(run.changed());
        assert_eq!(metastacks["a"].get("peer").unwrap(), Value::from("10.0.0.9"));
    }
}
