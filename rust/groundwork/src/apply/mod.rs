//! The apply engine.
//!
//! Executes a plan's changes in graph order under a bounded worker pool.
//! State is updated and persisted after every successful node (or in small
//! batches under a configurable watermark), so a crash leaves at most one
//! resource in an indeterminate state, discoverable on the next plan. A
//! failed node skips its descendants; independent branches continue. On
//! interrupt no new nodes are dispatched, running providers are asked to
//! stop, and the state is flushed; a second interrupt aborts the running
//! nodes instead of draining them, and only the flush still happens.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use groundwork_core::types::Type;
use groundwork_core::value::Value;
use tokio::sync::Mutex;

use crate::graph::{self, Graph};
use crate::interrupt::InterruptState;
use crate::plan::objects::{Action, OutputChange, Plan, ResourceChange};
use crate::provider::{ProviderOps, ProviderPool};
use crate::state::{OutputState, ResourceInstanceState, State};

/// Persists state snapshots as apply progresses.
#[async_trait]
pub trait StatePersister: Send + Sync {
    async fn persist(&self, state: &State) -> Result<()>;
}

/// Used when the caller persists separately (tests, dry runs).
pub struct NoPersist;

#[async_trait]
impl StatePersister for NoPersist {
    async fn persist(&self, _state: &State) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApplyOptions {
    pub parallelism: usize,
    /// Persist after every N successful changes. 1 gives the strongest
    /// crash guarantee; higher values batch writes.
    pub persist_every: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions {
            parallelism: graph::DEFAULT_PARALLELISM,
            persist_every: 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: Vec<(String, String)>,
    pub skipped: usize,
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Applies `plan` to `state` without intermediate persistence.
pub async fn apply(
    plan: &Plan,
    state: &mut State,
    pool: &ProviderPool,
    options: &ApplyOptions,
    interrupt: &InterruptState,
) -> Result<ApplyReport> {
    apply_with_persister(plan, state, pool, options, interrupt, Arc::new(NoPersist)).await
}

/// Applies `plan` to `state`, persisting through `persister` as it goes.
pub async fn apply_with_persister(
    plan: &Plan,
    state: &mut State,
    pool: &ProviderPool,
    options: &ApplyOptions,
    interrupt: &InterruptState,
    persister: Arc<dyn StatePersister>,
) -> Result<ApplyReport> {
    if !plan.applyable() {
        bail!("this plan is not applyable");
    }

    let changes: BTreeMap<String, ResourceChange> = plan
        .resource_changes
        .iter()
        .filter(|c| !c.action.is_no_op() && c.action != Action::Read && c.deferred.is_none())
        .map(|c| (node_key(c), c.clone()))
        .collect();

    let graph = build_apply_graph(&changes);
    if let Err(cycle) = graph.topo_order() {
        bail!("dependency cycle in plan: {}", cycle);
    }

    // Resolve every provider up front so workers and the stop watcher hold
    // owned handles.
    let mut providers: BTreeMap<String, Arc<dyn ProviderOps>> = BTreeMap::new();
    for change in changes.values() {
        if !providers.contains_key(&change.provider) {
            let client = pool
                .get(&change.provider, &Value::object(Default::default()))
                .await
                .with_context(|| format!("provider {:?} for apply", change.provider))?;
            providers.insert(change.provider.clone(), client);
        }
    }

    let executor = Arc::new(Executor {
        state: Mutex::new(state.clone()),
        changes,
        providers: providers.clone(),
        persister,
        successes_since_persist: Mutex::new(0),
        persist_every: options.persist_every.max(1),
    });

    // First interrupt: ask running providers to stop, best effort.
    let stop_watcher = {
        let interrupt = interrupt.clone();
        let providers: Vec<Arc<dyn ProviderOps>> = providers.values().cloned().collect();
        tokio::spawn(async move {
            loop {
                if interrupt.is_interrupted() {
                    for p in &providers {
                        let _ = p.stop().await;
                    }
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        })
    };

    let exec_for_walk = executor.clone();
    let walk_report = graph::walk(&graph, options.parallelism, interrupt, move |key: String| {
        let executor = exec_for_walk.clone();
        async move { executor.execute(&key).await }
    })
    .await;

    stop_watcher.abort();

    // Flush whatever succeeded, even on failure or cancellation.
    {
        let final_state = executor.state.lock().await;
        *state = final_state.clone();
    }
    finalize_outputs(plan, state);
    executor
        .persister
        .persist(state)
        .await
        .context("persisting final state")?;

    let mut report = ApplyReport {
        cancelled: interrupt.is_interrupted(),
        ..Default::default()
    };
    for (key, outcome) in &walk_report.outcomes {
        match outcome {
            graph::NodeOutcome::Ok => report.applied += 1,
            graph::NodeOutcome::Failed(e) => report.failed.push((key.clone(), e.clone())),
            graph::NodeOutcome::Skipped => report.skipped += 1,
        }
    }
    Ok(report)
}

/// Writes plan-time output changes whose values resolved, and drops deleted
/// outputs. Outputs still unknown at this point are settled by the next
/// plan round.
fn finalize_outputs(plan: &Plan, state: &mut State) {
    for (name, change) in &plan.output_changes {
        apply_output(state, name, change);
    }
}

fn apply_output(state: &mut State, name: &str, change: &OutputChange) {
    match change.action {
        Action::Delete => {
            state.outputs.remove(name);
        }
        Action::NoOp => {}
        _ => {
            if let Some(after) = &change.after {
                let value = after.to_value(&Type::Any);
                if !value.contains_unknown() {
                    state.outputs.insert(
                        name.to_string(),
                        OutputState {
                            value: after.json.clone(),
                            r#type: Type::of(&value),
                            sensitive: change.sensitive,
                        },
                    );
                }
            }
        }
    }
}

fn node_key(change: &ResourceChange) -> String {
    match &change.deposed {
        Some(key) => format!("{} (deposed {})", change.address, key),
        None => change.address.to_string(),
    }
}

/// Edges follow plan dependencies. Creates and updates wait for their
/// dependencies; destroys run in reverse order (a dependent is destroyed
/// before what it depends on).
fn build_apply_graph(changes: &BTreeMap<String, ResourceChange>) -> Graph<String> {
    let mut graph = Graph::new();
    for (key, change) in changes {
        graph.add_node(key.clone());
        for dep in &change.dependencies {
            if let Some(dep_change) = changes.get(dep) {
                let both_destroy = change.action == Action::Delete
                    && matches!(dep_change.action, Action::Delete | Action::Forget);
                if both_destroy {
                    graph.add_dependency(dep.clone(), key.clone());
                } else {
                    graph.add_dependency(key.clone(), dep.clone());
                }
            }
        }
        // A standalone deposed destroy waits for the live instance's change.
        if change.deposed.is_some() {
            let live = change.address.to_string();
            if changes.contains_key(&live) {
                graph.add_dependency(key.clone(), live);
            }
        }
    }
    graph
}

struct Executor {
    state: Mutex<State>,
    changes: BTreeMap<String, ResourceChange>,
    providers: BTreeMap<String, Arc<dyn ProviderOps>>,
    persister: Arc<dyn StatePersister>,
    successes_since_persist: Mutex<usize>,
    persist_every: usize,
}

impl Executor {
    fn provider(&self, change: &ResourceChange) -> Result<Arc<dyn ProviderOps>> {
        self.providers
            .get(&change.provider)
            .cloned()
            .with_context(|| format!("provider {:?} not resolved", change.provider))
    }

    async fn execute(&self, key: &str) -> Result<()> {
        let change = self
            .changes
            .get(key)
            .context("unknown node in apply graph")?
            .clone();
        tracing::info!(resource = key, action = ?change.action, "applying change");

        let before = change.before_value().unwrap_or_else(Value::null);
        let after = change.after_value().unwrap_or_else(Value::null);

        match change.action {
            Action::Forget => {
                {
                    let mut state = self.state.lock().await;
                    state.remove(&change.address, change.deposed.as_deref());
                }
                tracing::warn!(
                    "{} removed from state; the remote object is no longer managed",
                    change.address
                );
                self.persist_progress().await
            }
            Action::Create | Action::Update => {
                let provider = self.provider(&change)?;
                let (new_value, private) = provider
                    .apply_resource_change(
                        &change.type_name,
                        &after,
                        &before,
                        &after,
                        change.private.as_deref(),
                    )
                    .await
                    .with_context(|| format!("applying {}", change.address))?;
                self.record_success(&change, new_value, private).await
            }
            Action::Delete => {
                let provider = self.provider(&change)?;
                provider
                    .apply_resource_change(
                        &change.type_name,
                        &Value::null(),
                        &before,
                        &Value::null(),
                        change.private.as_deref(),
                    )
                    .await
                    .with_context(|| format!("destroying {}", change.address))?;
                {
                    let mut state = self.state.lock().await;
                    state.remove(&change.address, change.deposed.as_deref());
                }
                self.persist_progress().await
            }
            Action::DeleteThenCreate => {
                let provider = self.provider(&change)?;
                provider
                    .apply_resource_change(
                        &change.type_name,
                        &Value::null(),
                        &before,
                        &Value::null(),
                        change.private.as_deref(),
                    )
                    .await
                    .with_context(|| format!("destroying {} for replacement", change.address))?;
                {
                    let mut state = self.state.lock().await;
                    state.remove(&change.address, None);
                }
                self.persist_progress().await?;

                let (new_value, private) = provider
                    .apply_resource_change(&change.type_name, &after, &Value::null(), &after, None)
                    .await
                    .with_context(|| format!("recreating {}", change.address))?;
                self.record_success(&change, new_value, private).await
            }
            Action::CreateThenDelete => {
                // The predecessor stays in state as deposed until its
                // destroy half succeeds; an interrupted replace retries the
                // destroy on the next plan.
                let deposed_key = {
                    let mut state = self.state.lock().await;
                    state.depose(&change.address)
                };
                self.persist_progress().await?;

                let provider = self.provider(&change)?;
                let (new_value, private) = provider
                    .apply_resource_change(&change.type_name, &after, &Value::null(), &after, None)
                    .await
                    .with_context(|| format!("creating replacement {}", change.address))?;
                self.record_success(&change, new_value, private).await?;

                if let Some(deposed_key) = deposed_key {
                    provider
                        .apply_resource_change(
                            &change.type_name,
                            &Value::null(),
                            &before,
                            &Value::null(),
                            change.private.as_deref(),
                        )
                        .await
                        .with_context(|| {
                            format!("destroying deposed {} ({})", change.address, deposed_key)
                        })?;
                    {
                        let mut state = self.state.lock().await;
                        state.remove(&change.address, Some(&deposed_key));
                    }
                    self.persist_progress().await?;
                }
                Ok(())
            }
            Action::NoOp | Action::Read => Ok(()),
        }
    }

    async fn record_success(
        &self,
        change: &ResourceChange,
        new_value: Value,
        private: Option<String>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.put(ResourceInstanceState {
                address: change.address.clone(),
                deposed: None,
                schema_version: change.schema_version,
                attributes: new_value.to_wire_json(),
                sensitive_paths: new_value.sensitive_paths(),
                private,
                dependencies: change.dependencies.clone(),
                tainted: false,
                create_before_destroy: change.create_before_destroy,
                provider: change.provider.clone(),
            });
        }
        self.persist_progress().await
    }

    /// Persists the working snapshot once enough changes succeeded.
    async fn persist_progress(&self) -> Result<()> {
        let due = {
            let mut count = self.successes_since_persist.lock().await;
            *count += 1;
            if *count >= self.persist_every {
                *count = 0;
                true
            } else {
                false
            }
        };
        if due {
            let snapshot = self.state.lock().await.clone();
            self.persister
                .persist(&snapshot)
                .await
                .context("persisting state")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use groundwork_core::addr::InstanceAddr;
    use groundwork_core::value::Path;

    use crate::config;
    use crate::plan::objects::PlanMode;
    use crate::plan::{plan, PlanOptions};
    use crate::testing::{id_of, MockProvider};

    fn load(src: &str) -> config::Config {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.gw.hcl"), src).unwrap();
        let (config, diags) = config::load_dir(dir.path());
        assert!(!diags.has_errors(), "{:?}", diags);
        config
    }

    async fn pool_with(mock: Arc<MockProvider>) -> ProviderPool {
        let pool = ProviderPool::new(HashMap::new(), Default::default());
        pool.insert("null", mock).await;
        pool
    }

    fn addr(s: &str) -> InstanceAddr {
        s.parse().unwrap()
    }

    async fn plan_and_apply(
        src: &str,
        state: &mut State,
        mock: Arc<MockProvider>,
    ) -> ApplyReport {
        let config = load(src);
        let pool = pool_with(mock).await;
        let (p, diags) = plan(
            &config,
            &BTreeMap::new(),
            state,
            &pool,
            &PlanOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap();
        assert!(!diags.has_errors(), "{:?}", diags);
        apply(
            &p,
            state,
            &pool,
            &ApplyOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap()
    }

    const TWO: &str = r#"
    resource "null" "a" { triggers = { x = "1" } }
    resource "null" "b" { triggers = { up = null.a.id } }
    "#;

    #[tokio::test]
    async fn apply_calls_provider_once_per_change() {
        let mock = Arc::new(MockProvider::new());
        let mut state = State::new();
        let report = plan_and_apply(TWO, &mut state, mock.clone()).await;
        assert!(report.success(), "{:?}", report.failed);
        assert_eq!(report.applied, 2);
        // Exactly one ApplyResourceChange per non-no-op change.
        assert_eq!(mock.apply_calls.load(Ordering::SeqCst), 2);

        // The dependent saw its upstream's concrete id.
        let b = state.get(&addr("null.b"), None).unwrap();
        let v = b.value(&Type::Any);
        let up = v
            .value_at(&Path(vec![
                groundwork_core::value::PathStep::Attr("triggers".into()),
                groundwork_core::value::PathStep::Attr("up".into()),
            ]))
            .unwrap();
        let a = state.get(&addr("null.a"), None).unwrap();
        assert_eq!(
            up.as_str().map(String::from),
            id_of(&a.value(&Type::Any))
        );
    }

    #[tokio::test]
    async fn incremental_persistence_records_every_success() {
        struct CountingPersister {
            count: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl StatePersister for CountingPersister {
            async fn persist(&self, _state: &State) -> Result<()> {
                self.count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mock = Arc::new(MockProvider::new());
        let config = load(TWO);
        let pool = pool_with(mock).await;
        let mut state = State::new();
        let (p, _) = plan(
            &config,
            &BTreeMap::new(),
            &state,
            &pool,
            &PlanOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap();

        let persister = Arc::new(CountingPersister {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        apply_with_persister(
            &p,
            &mut state,
            &pool,
            &ApplyOptions::default(),
            &InterruptState::new(),
            persister.clone(),
        )
        .await
        .unwrap();

        // One per success plus the final flush.
        assert_eq!(persister.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_skips_descendants_and_keeps_partial_state() {
        struct FailSecond {
            inner: MockProvider,
        }
        #[async_trait]
        impl ProviderOps for FailSecond {
            async fn schema(&self) -> Result<groundwork_provider::schema::v1::ProviderSchema> {
                self.inner.schema().await
            }
            async fn validate_provider_config(
                &self,
                c: &Value,
            ) -> Result<Vec<groundwork_core::diag::Diagnostic>> {
                self.inner.validate_provider_config(c).await
            }
            async fn configure(&self, c: &Value) -> Result<()> {
                self.inner.configure(c).await
            }
            async fn validate_resource_config(
                &self,
                t: &str,
                c: &Value,
            ) -> Result<Vec<groundwork_core::diag::Diagnostic>> {
                self.inner.validate_resource_config(t, c).await
            }
            async fn upgrade_resource_state(
                &self,
                t: &str,
                r: &serde_json::Value,
                v: u64,
            ) -> Result<Value> {
                self.inner.upgrade_resource_state(t, r, v).await
            }
            async fn read_resource(
                &self,
                t: &str,
                s: &Value,
                p: Option<&str>,
            ) -> Result<crate::provider::ReadResponse> {
                self.inner.read_resource(t, s, p).await
            }
            async fn plan_resource_change(
                &self,
                t: &str,
                c: &Value,
                prior: &Value,
                proposed: &Value,
            ) -> Result<crate::provider::PlannedChangeResponse> {
                self.inner.plan_resource_change(t, c, prior, proposed).await
            }
            async fn apply_resource_change(
                &self,
                t: &str,
                c: &Value,
                prior: &Value,
                planned: &Value,
                p: Option<&str>,
            ) -> Result<(Value, Option<String>)> {
                if self.inner.apply_calls.load(Ordering::SeqCst) >= 1 {
                    anyhow::bail!("provider exploded");
                }
                self.inner
                    .apply_resource_change(t, c, prior, planned, p)
                    .await
            }
            async fn stop(&self) -> Result<()> {
                Ok(())
            }
        }

        let failing = Arc::new(FailSecond {
            inner: MockProvider::new(),
        });
        let pool = ProviderPool::new(HashMap::new(), Default::default());
        pool.insert("null", failing).await;

        let config = load(TWO);
        let mut state = State::new();
        let (p, _) = plan(
            &config,
            &BTreeMap::new(),
            &state,
            &pool,
            &PlanOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap();
        let report = apply(
            &p,
            &mut state,
            &pool,
            &ApplyOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap();

        // a applied, b failed (it runs second, after a).
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].0.contains("null.b"));
        // Partial state kept: a exists, b does not.
        assert!(state.get(&addr("null.a"), None).is_some());
        assert!(state.get(&addr("null.b"), None).is_none());
    }

    #[tokio::test]
    async fn replace_destroys_then_creates() {
        let mock = Arc::new(MockProvider::new());
        let mut state = State::new();
        plan_and_apply(
            r#"resource "null" "a" { triggers = { x = "1" } }"#,
            &mut state,
            mock.clone(),
        )
        .await;
        let first_id = id_of(
            &state
                .get(&addr("null.a"), None)
                .unwrap()
                .value(&Type::Any),
        )
        .unwrap();

        let report = plan_and_apply(
            r#"resource "null" "a" { triggers = { x = "2" } }"#,
            &mut state,
            mock.clone(),
        )
        .await;
        assert!(report.success(), "{:?}", report.failed);

        // 1 create + (1 destroy + 1 create) for the replacement.
        assert_eq!(mock.apply_calls.load(Ordering::SeqCst), 3);
        let second_id = id_of(
            &state
                .get(&addr("null.a"), None)
                .unwrap()
                .value(&Type::Any),
        )
        .unwrap();
        assert_ne!(first_id, second_id);
        assert!(state.deposed_of(&addr("null.a")).is_empty());
    }

    #[tokio::test]
    async fn create_before_destroy_keeps_deposed_until_destroyed() {
        let mock = Arc::new(MockProvider::new());
        let mut state = State::new();
        plan_and_apply(
            r#"
            resource "null" "a" {
              triggers = { x = "1" }
              lifecycle { create_before_destroy = true }
            }
            "#,
            &mut state,
            mock.clone(),
        )
        .await;

        let report = plan_and_apply(
            r#"
            resource "null" "a" {
              triggers = { x = "2" }
              lifecycle { create_before_destroy = true }
            }
            "#,
            &mut state,
            mock.clone(),
        )
        .await;
        assert!(report.success(), "{:?}", report.failed);
        // Replacement completed: successor live, no deposed leftovers.
        assert!(state.get(&addr("null.a"), None).is_some());
        assert!(state.deposed_of(&addr("null.a")).is_empty());
    }

    #[tokio::test]
    async fn destroy_plan_empties_state() {
        let mock = Arc::new(MockProvider::new());
        let mut state = State::new();
        plan_and_apply(
            r#"resource "null" "a" { triggers = { x = "1" } }"#,
            &mut state,
            mock.clone(),
        )
        .await;

        let config = load(r#"resource "null" "a" { triggers = { x = "1" } }"#);
        let pool = pool_with(mock).await;
        let (p, _) = plan(
            &config,
            &BTreeMap::new(),
            &state,
            &pool,
            &PlanOptions {
                mode: PlanMode::Destroy,
                ..Default::default()
            },
            &InterruptState::new(),
        )
        .await
        .unwrap();
        let report = apply(
            &p,
            &mut state,
            &pool,
            &ApplyOptions::default(),
            &InterruptState::new(),
        )
        .await
        .unwrap();
        assert!(report.success(), "{:?}", report.failed);
        assert!(state.resources.is_empty());
    }

    #[test]
    fn destroys_run_in_reverse_dependency_order() {
        let make = |addr: &str, action: Action, deps: Vec<&str>| ResourceChange {
            address: addr.parse().unwrap(),
            previous_address: None,
            deposed: None,
            type_name: "null".to_string(),
            provider: "null".to_string(),
            schema_version: 1,
            action,
            action_reason: None,
            before: None,
            after: None,
            replace_paths: Vec::new(),
            deferred: None,
            private: None,
            importing: None,
            generated_config: None,
            dependencies: deps.into_iter().map(String::from).collect(),
            create_before_destroy: false,
        };

        // Creating: b waits for a. Destroying: a waits for b.
        let creates: BTreeMap<String, ResourceChange> = [
            ("null.a".to_string(), make("null.a", Action::Create, vec![])),
            (
                "null.b".to_string(),
                make("null.b", Action::Create, vec!["null.a"]),
            ),
        ]
        .into_iter()
        .collect();
        let order = build_apply_graph(&creates).topo_order().unwrap();
        assert_eq!(order, vec!["null.a", "null.b"]);

        let destroys: BTreeMap<String, ResourceChange> = [
            ("null.a".to_string(), make("null.a", Action::Delete, vec![])),
            (
                "null.b".to_string(),
                make("null.b", Action::Delete, vec!["null.a"]),
            ),
        ]
        .into_iter()
        .collect();
        let order = build_apply_graph(&destroys).topo_order().unwrap();
        assert_eq!(order, vec!["null.b", "null.a"]);
    }

    #[tokio::test]
    async fn outputs_written_when_resolved() {
        let mock = Arc::new(MockProvider::new());
        let mut state = State::new();
        // First round: output references an unknown id, so it settles on
        // the second round.
        plan_and_apply(
            r#"
            resource "null" "a" { triggers = { x = "1" } }
            output "a_id" { value = null.a.id }
            "#,
            &mut state,
            mock.clone(),
        )
        .await;
        assert!(state.outputs.is_empty());

        plan_and_apply(
            r#"
            resource "null" "a" { triggers = { x = "1" } }
            output "a_id" { value = null.a.id }
            "#,
            &mut state,
            mock,
        )
        .await;
        let out = state.outputs.get("a_id").unwrap();
        assert!(out.value.is_string());
    }
}
