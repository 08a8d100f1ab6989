//! Dependency graph construction and ordered walking.
//!
//! [`Graph`] is a small DAG keyed by an ordered node type. Construction
//! happens twice per run: once over configuration objects (variables,
//! locals, providers, resources, outputs, module calls) to drive
//! evaluation, and once over planned resource instances to drive apply.
//!
//! Walks are topological with stable lexical tie-breaks. [`walk`] runs
//! nodes concurrently under a bounded worker pool; a failed node skips its
//! descendants while independent branches continue.

pub mod config_graph;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::interrupt::InterruptState;

/// The hard floor for walk parallelism.
pub const MIN_PARALLELISM: usize = 1;
/// Default walk parallelism when no option is given.
pub const DEFAULT_PARALLELISM: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct Graph<K: Ord + Clone> {
    nodes: BTreeSet<K>,
    /// node -> the nodes it depends on
    dependencies: BTreeMap<K, BTreeSet<K>>,
}

/// A dependency cycle, reported with its full path. The last element
/// depends on the first.
#[derive(Debug, Clone)]
pub struct Cycle<K> {
    pub path: Vec<K>,
}

impl<K: Display> Display for Cycle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for k in &self.path {
            write!(f, "{} -> ", k)?;
        }
        match self.path.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

impl<K: Ord + Clone + Display> Graph<K> {
    pub fn new() -> Graph<K> {
        Graph {
            nodes: BTreeSet::new(),
            dependencies: BTreeMap::new(),
        }
    }

    pub fn add_node(&mut self, node: K) {
        self.nodes.insert(node);
    }

    pub fn contains(&self, node: &K) -> bool {
        self.nodes.contains(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Records that `node` depends on `dependency`. Both are added if absent.
    pub fn add_dependency(&mut self, node: K, dependency: K) {
        if node == dependency {
            return;
        }
        self.nodes.insert(node.clone());
        self.nodes.insert(dependency.clone());
        self.dependencies.entry(node).or_default().insert(dependency);
    }

    pub fn dependencies_of(&self, node: &K) -> impl Iterator<Item = &K> {
        self.dependencies.get(node).into_iter().flatten()
    }

    /// Nodes in topological order, dependencies first, lexical order among
    /// ties. Fails with the full path of one cycle if any exists.
    pub fn topo_order(&self) -> Result<Vec<K>, Cycle<K>> {
        let mut remaining_deps: BTreeMap<K, BTreeSet<K>> = self
            .nodes
            .iter()
            .map(|n| {
                let deps = self
                    .dependencies
                    .get(n)
                    .map(|d| d.iter().filter(|d| self.nodes.contains(d)).cloned().collect())
                    .unwrap_or_default();
                (n.clone(), deps)
            })
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        loop {
            // BTreeMap iteration gives the lexically-least ready node first.
            let next = remaining_deps
                .iter()
                .find(|(_, deps)| deps.is_empty())
                .map(|(n, _)| n.clone());
            match next {
                Some(n) => {
                    remaining_deps.remove(&n);
                    for deps in remaining_deps.values_mut() {
                        deps.remove(&n);
                    }
                    order.push(n);
                }
                None => break,
            }
        }

        if !remaining_deps.is_empty() {
            return Err(self.find_cycle(&remaining_deps));
        }
        Ok(order)
    }

    fn find_cycle(&self, stuck: &BTreeMap<K, BTreeSet<K>>) -> Cycle<K> {
        // Every stuck node sits on or leads into a cycle; follow the least
        // dependency from the least stuck node until a repeat.
        let mut path: Vec<K> = Vec::new();
        let mut seen: BTreeSet<K> = BTreeSet::new();
        let mut cur = stuck.keys().next().expect("stuck set is non-empty").clone();
        loop {
            if let Some(pos) = path.iter().position(|k| *k == cur) {
                return Cycle {
                    path: path[pos..].to_vec(),
                };
            }
            seen.insert(cur.clone());
            path.push(cur.clone());
            cur = stuck
                .get(&cur)
                .and_then(|deps| deps.iter().next())
                .expect("stuck node must have a stuck dependency")
                .clone();
        }
    }

    /// The reverse adjacency: node -> nodes depending on it.
    fn dependents(&self) -> BTreeMap<K, Vec<K>> {
        let mut out: BTreeMap<K, Vec<K>> = BTreeMap::new();
        for (node, deps) in &self.dependencies {
            for dep in deps {
                out.entry(dep.clone()).or_default().push(node.clone());
            }
        }
        out
    }
}

/// Result of one node in a walk.
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    Ok,
    Failed(String),
    /// Not executed because a dependency failed or the walk was cancelled.
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct WalkReport<K: Ord> {
    pub outcomes: BTreeMap<K, NodeOutcome>,
}

impl<K: Ord + Display> WalkReport<K> {
    pub fn failed(&self) -> impl Iterator<Item = (&K, &str)> {
        self.outcomes.iter().filter_map(|(k, o)| match o {
            NodeOutcome::Failed(e) => Some((k, e.as_str())),
            _ => None,
        })
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, NodeOutcome::Skipped))
            .count()
    }
}

/// Walks the graph in dependency order with at most `parallelism` nodes
/// running at once.
///
/// For every edge u -> v in the graph, v begins only after u completed
/// successfully. A failure or cancellation skips all transitive dependents;
/// unrelated branches keep running. The first interrupt stops dispatching
/// new nodes while running ones drain; a second interrupt aborts the
/// running nodes outright. The graph must be acyclic (check with
/// [`Graph::topo_order`] first).
pub async fn walk<K, F, Fut>(
    graph: &Graph<K>,
    parallelism: usize,
    interrupt: &InterruptState,
    work: F,
) -> WalkReport<K>
where
    K: Ord + Clone + Display + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let work = Arc::new(work);
    let semaphore = Arc::new(Semaphore::new(parallelism.max(MIN_PARALLELISM)));

    let dependents = graph.dependents();
    let mut waiting: BTreeMap<K, usize> = graph
        .nodes
        .iter()
        .map(|n| {
            let count = graph
                .dependencies
                .get(n)
                .map(|d| d.iter().filter(|d| graph.nodes.contains(d)).count())
                .unwrap_or(0);
            (n.clone(), count)
        })
        .collect();

    let mut report = WalkReport {
        outcomes: BTreeMap::new(),
    };
    let mut poisoned: BTreeSet<K> = BTreeSet::new();
    let mut ready: VecDeque<K> = waiting
        .iter()
        .filter(|(_, c)| **c == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut running = 0usize;
    let mut join_set: JoinSet<(K, anyhow::Result<()>)> = JoinSet::new();

    loop {
        while let Some(node) = ready.pop_front() {
            if interrupt.is_interrupted() || poisoned.contains(&node) {
                // Complete the node as skipped without running it, releasing
                // its dependents (which will skip in turn).
                report.outcomes.insert(node.clone(), NodeOutcome::Skipped);
                complete(
                    &node,
                    false,
                    &dependents,
                    &mut waiting,
                    &mut poisoned,
                    &mut ready,
                );
                continue;
            }
            running += 1;
            let work = work.clone();
            let semaphore = semaphore.clone();
            let node_for_task = node.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("walk semaphore closed");
                let result = work(node_for_task.clone()).await;
                (node_for_task, result)
            });
        }

        if running == 0 {
            break;
        }

        let joined = tokio::select! {
            joined = join_set.join_next() => joined,
            _ = wait_for_abort(interrupt) => {
                // Fatal abort: cancel whatever is still running and stop
                // draining. The caller flushes state; data loss is possible.
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                break;
            }
        };
        match joined {
            Some(Ok((node, result))) => {
                running -= 1;
                let ok = result.is_ok();
                match result {
                    Ok(()) => {
                        report.outcomes.insert(node.clone(), NodeOutcome::Ok);
                    }
                    Err(e) => {
                        tracing::error!(node = %node, "node failed: {:#}", e);
                        report
                            .outcomes
                            .insert(node.clone(), NodeOutcome::Failed(format!("{:#}", e)));
                    }
                }
                complete(
                    &node,
                    ok,
                    &dependents,
                    &mut waiting,
                    &mut poisoned,
                    &mut ready,
                );
            }
            Some(Err(join_error)) => {
                // A panicked node poisons nothing we can name; surface it.
                tracing::error!("walk task panicked: {}", join_error);
                running -= 1;
            }
            None => break,
        }
    }

    // Nodes never dispatched (abort, or stuck behind one) count as skipped.
    for node in &graph.nodes {
        report
            .outcomes
            .entry(node.clone())
            .or_insert(NodeOutcome::Skipped);
    }

    report
}

async fn wait_for_abort(interrupt: &InterruptState) {
    loop {
        if interrupt.is_aborted() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn complete<K: Ord + Clone>(
    node: &K,
    ok: bool,
    dependents: &BTreeMap<K, Vec<K>>,
    waiting: &mut BTreeMap<K, usize>,
    poisoned: &mut BTreeSet<K>,
    ready: &mut VecDeque<K>,
) {
    if let Some(deps) = dependents.get(node) {
        for dependent in deps {
            if !ok {
                poisoned.insert(dependent.clone());
            }
            if let Some(count) = waiting.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent.clone());
                }
            }
        }
    }
}
