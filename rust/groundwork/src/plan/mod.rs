//! The plan engine.
//!
//! Walks the configuration graph in topological order, evaluating
//! expressions as it goes. Managed resources are refreshed against the
//! provider's live view (recording drift), proposed values are computed
//! from prior state and configuration honoring `ignore_changes`, and the
//! provider's PlanResourceChange decides the authoritative planned value
//! and any forced replacements. The result is an ordered, applyable set of
//! changes plus output changes, drift and check results.

pub mod file;
pub mod objects;

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use groundwork_core::addr::{InstanceAddr, InstanceKey, ModulePath, ResourceMode};
use groundwork_core::diag::{Diagnostic, Diagnostics};
use groundwork_core::types::{convert, Type};
use groundwork_core::value::{Path, PathStep, Value, ValueKind};
use groundwork_provider::schema::v1::{
    BlockSchema, DeferredReason, ProviderSchema, WireValue,
};

use crate::config::{Config, Module, ResourceConfig};
use crate::eval::{evaluate, Scope};
use crate::graph::config_graph::{self, ConfigNode};
use crate::interrupt::InterruptState;
use crate::provider::ProviderPool;
use crate::state::{ResourceInstanceState, State};
use objects::{
    Action, ActionReason, CheckKind, CheckResult, CheckStatus, OutputChange, Plan, PlanMode,
    ResourceChange,
};

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub mode: PlanMode,
    /// Skip the refresh phase when false.
    pub refresh: bool,
    /// Restrict planning to these resource addresses (plus dependencies).
    pub targets: Vec<String>,
    /// Instance addresses whose replacement was requested with `-replace`.
    pub replace: Vec<String>,
    /// Instance addresses to drop from state without destroying.
    pub forget: Vec<String>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            mode: PlanMode::Normal,
            refresh: true,
            targets: Vec::new(),
            replace: Vec::new(),
            forget: Vec::new(),
        }
    }
}

struct Planner<'a> {
    config: &'a Config,
    pool: &'a ProviderPool,
    options: &'a PlanOptions,
    interrupt: &'a InterruptState,
    /// Working state: prior state mutated by refresh results.
    state: State,
    scopes: BTreeMap<ModulePath, Scope>,
    provider_configs: BTreeMap<(ModulePath, String), Value>,
    schemas: BTreeMap<String, ProviderSchema>,
    /// Planned instance addresses per (module, resource key), for
    /// dependency recording.
    instances_of: BTreeMap<(ModulePath, String), Vec<InstanceAddr>>,
    module_outputs: BTreeMap<ModulePath, BTreeMap<String, Value>>,
    plan: Plan,
    diags: Diagnostics,
}

/// Produces a plan for `config` against `prior_state`.
pub async fn plan(
    config: &Config,
    variables: &BTreeMap<String, Value>,
    prior_state: &State,
    pool: &ProviderPool,
    options: &PlanOptions,
    interrupt: &InterruptState,
) -> Result<(Plan, Diagnostics)> {
    let graph = config_graph::build(config);
    let mut planner = Planner {
        config,
        pool,
        options,
        interrupt,
        state: prior_state.clone(),
        scopes: BTreeMap::new(),
        provider_configs: BTreeMap::new(),
        schemas: BTreeMap::new(),
        instances_of: BTreeMap::new(),
        module_outputs: BTreeMap::new(),
        plan: Plan::new(options.mode, prior_state.clone()),
        diags: Diagnostics::new(),
    };
    planner.plan.variables = variables
        .iter()
        .map(|(k, v)| (k.clone(), v.to_wire_json()))
        .collect();

    let order = match graph.topo_order() {
        Ok(order) => order,
        Err(cycle) => {
            planner
                .diags
                .error(format!("dependency cycle: {}", cycle));
            planner.plan.errored = true;
            return Ok((planner.plan, planner.diags));
        }
    };

    planner.seed_scopes(variables);

    for node in order {
        if planner.interrupt.is_interrupted() {
            planner.diags.error("operation cancelled");
            break;
        }
        if let Err(e) = planner.visit(&node).await {
            planner
                .diags
                .push(Diagnostic::error(format!("planning {}", node)).with_detail(format!("{:#}", e)));
        }
    }

    if !planner.interrupt.is_interrupted() {
        planner.sweep_orphans();
        planner.plan_output_changes();
    }

    planner.apply_target_filter();
    planner.plan.errored = planner.diags.has_errors();
    planner.plan.resource_changes.sort_by(|a, b| {
        (&a.address, &a.deposed).cmp(&(&b.address, &b.deposed))
    });
    Ok((planner.plan, planner.diags))
}

impl<'a> Planner<'a> {
    fn seed_scopes(&mut self, variables: &BTreeMap<String, Value>) {
        let root_dir = self.config.root.source_dir.display().to_string();
        self.config.root.walk_modules(&mut |module| {
            let mut scope = Scope::default();
            scope.path.insert(
                "module".to_string(),
                Value::string(module.source_dir.display().to_string()),
            );
            scope
                .path
                .insert("root".to_string(), Value::string(root_dir.clone()));
            if module.path.is_root() {
                scope.vars = variables.clone();
            }
            self.scopes.insert(module.path.clone(), scope);
        });
    }

    fn module(&self, path: &ModulePath) -> &Module {
        self.config
            .root
            .descendant(path)
            .expect("graph nodes reference existing modules")
    }

    fn scope(&self, path: &ModulePath) -> &Scope {
        self.scopes.get(path).expect("scope exists for module")
    }

    async fn visit(&mut self, node: &ConfigNode) -> Result<()> {
        match node {
            ConfigNode::Variable(path, name) => self.visit_variable(path, name),
            ConfigNode::Local(path, name) => self.visit_local(path, name),
            ConfigNode::Provider(path, name) => self.visit_provider(path, name),
            ConfigNode::Resource(path, key) => self.visit_resource(path, key).await,
            ConfigNode::Output(path, name) => self.visit_output(path, name),
            ConfigNode::ModuleCall(path, name) => self.visit_module_call(path, name),
        }
    }

    fn visit_variable(&mut self, path: &ModulePath, name: &str) -> Result<()> {
        let module = self.module(path);
        let decl = match module.variables.get(name) {
            Some(d) => d.clone(),
            None => return Ok(()),
        };

        // Root variables were bound before planning; child module variables
        // are fed by the call's argument in the parent scope.
        if !path.is_root() {
            let (parent_path, call_name) = path.parent().expect("non-root path has parent");
            let parent_module = self.module(&parent_path);
            let call = parent_module
                .module_calls
                .get(call_name)
                .context("module call exists")?
                .clone();
            let value = match call.arguments.get(name) {
                Some(expr) => {
                    let parent_scope = self.scope(&parent_path);
                    match evaluate(expr, parent_scope) {
                        Ok(v) => v,
                        Err(e) => {
                            self.diags.push(
                                Diagnostic::error(format!(
                                    "invalid argument {:?} for module {:?}",
                                    name, call_name
                                ))
                                .with_detail(e.to_string()),
                            );
                            return Ok(());
                        }
                    }
                }
                None => match &decl.default {
                    Some(default) => match crate::eval::eval_literal(default) {
                        Ok(v) => v,
                        Err(e) => {
                            self.diags.error(format!(
                                "invalid default for {}.var.{}: {}",
                                path, name, e
                            ));
                            return Ok(());
                        }
                    },
                    None => {
                        self.diags.error(format!(
                            "module {:?} requires an argument for variable {:?}",
                            call_name, name
                        ));
                        return Ok(());
                    }
                },
            };
            let mut value = match &decl.r#type {
                Some(ty) => match convert(&value, ty) {
                    Ok(v) => v,
                    Err(e) => {
                        self.diags.error(format!(
                            "invalid value for {}.var.{}: {}",
                            path, name, e
                        ));
                        return Ok(());
                    }
                },
                None => value,
            };
            if decl.sensitive {
                value = value.mark_sensitive();
            }
            self.scopes
                .get_mut(path)
                .expect("scope exists")
                .vars
                .insert(name.to_string(), value);
        }

        // Validation rules run wherever the value came from.
        if !self.scope(path).vars.contains_key(name) {
            return Ok(());
        }
        let address = if path.is_root() {
            format!("var.{}", name)
        } else {
            format!("{}.var.{}", path, name)
        };
        for rule in &decl.validations {
            let scope = self.scope(path).clone();
            let (status, problem) = match evaluate(&rule.condition, &scope) {
                Ok(cond) if cond.is_unknown() => (CheckStatus::Unknown, None),
                Ok(cond) => match cond.as_bool() {
                    Some(true) => (CheckStatus::Pass, None),
                    _ => {
                        let message = evaluate(&rule.error_message, &scope)
                            .ok()
                            .and_then(|m| m.as_str().map(String::from))
                            .unwrap_or_else(|| "variable validation failed".to_string());
                        (CheckStatus::Fail, Some(message))
                    }
                },
                Err(e) => (CheckStatus::Error, Some(e.to_string())),
            };
            if let Some(problem) = &problem {
                self.diags.push(
                    Diagnostic::error(format!("invalid value for variable {:?}", name))
                        .with_detail(problem.clone())
                        .with_range(decl.range.clone()),
                );
            }
            self.plan.checks.push(CheckResult {
                kind: CheckKind::Resource,
                address: address.clone(),
                status,
                problems: problem.into_iter().collect(),
            });
        }
        Ok(())
    }

    fn visit_local(&mut self, path: &ModulePath, name: &str) -> Result<()> {
        let module = self.module(path);
        let expr = match module.locals.get(name) {
            Some(e) => e.clone(),
            None => return Ok(()),
        };
        let scope = self.scope(path).clone();
        match evaluate(&expr, &scope) {
            Ok(v) => {
                self.scopes
                    .get_mut(path)
                    .expect("scope exists")
                    .locals
                    .insert(name.to_string(), v);
            }
            Err(e) => self
                .diags
                .push(Diagnostic::error(format!("invalid local {:?}", name)).with_detail(e.to_string())),
        }
        Ok(())
    }

    fn visit_provider(&mut self, path: &ModulePath, name: &str) -> Result<()> {
        let module = self.module(path);
        let body = match module.providers.get(name) {
            Some(p) => p.body.clone(),
            None => return Ok(()),
        };
        let scope = self.scope(path).clone();
        let mut attrs = BTreeMap::new();
        for (attr, expr) in &body {
            match evaluate(expr, &scope) {
                Ok(v) => {
                    attrs.insert(attr.clone(), v);
                }
                Err(e) => self.diags.push(
                    Diagnostic::error(format!(
                        "invalid configuration for provider {:?}",
                        name
                    ))
                    .with_detail(e.to_string()),
                ),
            }
        }
        self.provider_configs
            .insert((path.clone(), name.to_string()), Value::object(attrs));
        Ok(())
    }

    fn visit_output(&mut self, path: &ModulePath, name: &str) -> Result<()> {
        let module = self.module(path);
        let output = match module.outputs.get(name) {
            Some(o) => o.clone(),
            None => return Ok(()),
        };
        let scope = self.scope(path).clone();
        let value = match evaluate(&output.value, &scope) {
            Ok(v) => v,
            Err(e) => {
                self.diags.push(
                    Diagnostic::error(format!("invalid output {:?}", name))
                        .with_detail(e.to_string())
                        .with_range(output.range.clone()),
                );
                return Ok(());
            }
        };

        if value.contains_sensitive() && !output.sensitive {
            self.diags.push(
                Diagnostic::error(format!(
                    "output {:?} depends on sensitive values and must be declared sensitive",
                    name
                ))
                .with_range(output.range.clone()),
            );
            self.plan.checks.push(CheckResult {
                kind: CheckKind::OutputValue,
                address: format!("output.{}", name),
                status: CheckStatus::Error,
                problems: vec!["undeclared sensitive output".to_string()],
            });
        }

        self.module_outputs
            .entry(path.clone())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn visit_module_call(&mut self, path: &ModulePath, name: &str) -> Result<()> {
        let module = self.module(path);
        let call = match module.module_calls.get(name) {
            Some(c) => c.clone(),
            None => return Ok(()),
        };
        if call.count.is_some() || call.for_each.is_some() {
            self.diags.push(
                Diagnostic::error(format!(
                    "module {:?} uses count/for_each, which is limited to a single instance",
                    name
                ))
                .with_range(call.range.clone()),
            );
        }
        let child_path = path.child(name.to_string());
        let outputs = self
            .module_outputs
            .get(&child_path)
            .cloned()
            .unwrap_or_default();
        self.scopes
            .get_mut(path)
            .expect("scope exists")
            .modules
            .insert(name.to_string(), Value::object(outputs));
        Ok(())
    }

    async fn provider_for(
        &mut self,
        path: &ModulePath,
        resource: &ResourceConfig,
    ) -> Result<(String, std::sync::Arc<dyn crate::provider::ProviderOps>)> {
        let local_name = resource.provider_local_name().to_string();
        let (config_module, config_name) = self.resolve_provider_config(path, &local_name);
        let config = self
            .provider_configs
            .get(&(config_module, config_name))
            .cloned()
            .unwrap_or_else(|| Value::object(BTreeMap::new()));
        let client = self.pool.get(&local_name, &config).await?;
        if !self.schemas.contains_key(&local_name) {
            let schema = client.schema().await?;
            self.schemas.insert(local_name.clone(), schema);
        }
        Ok((local_name, client))
    }

    /// Finds the module whose provider block configures `local_name` for
    /// resources under `path`: the resource's own module first, then up
    /// through module calls, following each call's `providers` map.
    fn resolve_provider_config(
        &self,
        path: &ModulePath,
        local_name: &str,
    ) -> (ModulePath, String) {
        let mut module_path = path.clone();
        let mut name = local_name.to_string();
        loop {
            if self
                .provider_configs
                .contains_key(&(module_path.clone(), name.clone()))
            {
                return (module_path, name);
            }
            let (parent_path, call_name) = match module_path.parent() {
                Some(p) => p,
                None => return (ModulePath::root(), name),
            };
            if let Some(parent) = self.config.root.descendant(&parent_path) {
                if let Some(call) = parent.module_calls.get(call_name) {
                    if let Some(mapped) = call.providers.get(&name) {
                        name = mapped.clone();
                    }
                }
            }
            module_path = parent_path;
        }
    }

    fn resource_schema<'s>(
        schemas: &'s BTreeMap<String, ProviderSchema>,
        provider: &str,
        resource: &ResourceConfig,
    ) -> (BlockSchema, u64) {
        let schema = schemas.get(provider);
        let entry = schema.and_then(|s| match resource.mode {
            ResourceMode::Managed => s.resource_schemas.get(&resource.r#type),
            ResourceMode::Data => s.data_schemas.get(&resource.r#type),
        });
        match entry {
            Some(r) => (r.block.clone(), r.version),
            None => (BlockSchema::default(), 0),
        }
    }

    async fn visit_resource(&mut self, path: &ModulePath, key: &str) -> Result<()> {
        let module = self.module(path);
        let resource = match module.resources.get(key) {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        let (provider_name, client) = self.provider_for(path, &resource).await?;
        let (block, schema_version) =
            Self::resource_schema(&self.schemas, &provider_name, &resource);
        let addr_base = match resource.mode {
            ResourceMode::Managed => {
                groundwork_core::addr::ResourceAddr::managed(path.clone(), &resource.r#type, &resource.name)
            }
            ResourceMode::Data => {
                groundwork_core::addr::ResourceAddr::data(path.clone(), &resource.r#type, &resource.name)
            }
        };

        // Resolve the repetition argument.
        let scope = self.scope(path).clone();
        let expansion = match self.expand(&resource, &scope) {
            Ok(e) => e,
            Err(diag) => {
                self.diags.push(diag);
                return Ok(());
            }
        };

        let keys: Vec<InstanceKey> = match expansion {
            Expansion::Single => vec![InstanceKey::None],
            Expansion::Count(n) => (0..n).map(InstanceKey::Index).collect(),
            Expansion::ForEach(ref map_keys) => map_keys
                .iter()
                .map(|k| InstanceKey::Key(k.clone()))
                .collect(),
            Expansion::Deferred => {
                // One placeholder change; the instance set fans out on the
                // next round, after apply resolves the repetition input.
                let address = addr_base.instance(InstanceKey::None);
                self.record_scope_value(path, &resource, Value::unknown(block.implied_type()));
                self.plan.resource_changes.push(ResourceChange {
                    address,
                    previous_address: None,
                    deposed: None,
                    type_name: resource.r#type.clone(),
                    provider: provider_name.clone(),
                    schema_version,
                    action: Action::NoOp,
                    action_reason: Some(ActionReason::ReadBecauseConfigUnknown),
                    before: None,
                    after: None,
                    replace_paths: Vec::new(),
                    deferred: Some(DeferredReason::ResourceConfigUnknown),
                    private: None,
                    importing: None,
                    generated_config: None,
                    dependencies: Vec::new(),
                    create_before_destroy: resource.lifecycle.create_before_destroy,
                });
                return Ok(());
            }
        };

        let dependencies = self.dependencies_for(path, key, &resource);
        let mut instance_values: BTreeMap<InstanceKey, Value> = BTreeMap::new();
        let mut planned_addrs = Vec::new();

        for instance_key in &keys {
            let address = addr_base.instance(instance_key.clone());
            planned_addrs.push(address.clone());
            let value = self
                .plan_instance(
                    path,
                    &resource,
                    &address,
                    &block,
                    schema_version,
                    &provider_name,
                    client.as_ref(),
                    &dependencies,
                    &expansion,
                )
                .await?;
            instance_values.insert(instance_key.clone(), value);
        }

        // Instances recorded in state but not in the current expansion are
        // orphans of this resource block.
        self.plan_repetition_orphans(
            &addr_base,
            &keys,
            &resource,
            &provider_name,
            schema_version,
        );

        self.instances_of
            .insert((path.clone(), key.to_string()), planned_addrs);

        // Expose the resource in the evaluation scope.
        let scope_value = match keys.as_slice() {
            [InstanceKey::None] => instance_values
                .remove(&InstanceKey::None)
                .unwrap_or_else(Value::null),
            _ => match &expansion {
                Expansion::ForEach(_) => Value::object(
                    instance_values
                        .into_iter()
                        .map(|(k, v)| match k {
                            InstanceKey::Key(s) => (s, v),
                            other => (other.to_string(), v),
                        })
                        .collect(),
                ),
                _ => Value::tuple(instance_values.into_values().collect()),
            },
        };
        self.record_scope_value(path, &resource, scope_value);
        Ok(())
    }

    fn record_scope_value(&mut self, path: &ModulePath, resource: &ResourceConfig, value: Value) {
        let scope = self.scopes.get_mut(path).expect("scope exists");
        let map = match resource.mode {
            ResourceMode::Managed => &mut scope.managed,
            ResourceMode::Data => &mut scope.data,
        };
        map.entry(resource.r#type.clone())
            .or_default()
            .insert(resource.name.clone(), value);
    }

    fn expand(&self, resource: &ResourceConfig, scope: &Scope) -> Result<Expansion, Diagnostic> {
        if let Some(count_expr) = &resource.count {
            let count = evaluate(count_expr, scope).map_err(|e| {
                Diagnostic::error(format!(
                    "invalid count for {}.{}",
                    resource.r#type, resource.name
                ))
                .with_detail(e.to_string())
            })?;
            if count.is_unknown() {
                return Ok(Expansion::Deferred);
            }
            let n = count
                .as_number()
                .and_then(|n| n.as_i64())
                .filter(|n| *n >= 0)
                .ok_or_else(|| {
                    Diagnostic::error(format!(
                        "count for {}.{} must be a non-negative integer",
                        resource.r#type, resource.name
                    ))
                })?;
            return Ok(Expansion::Count(n as usize));
        }
        if let Some(for_each_expr) = &resource.for_each {
            let collection = evaluate(for_each_expr, scope).map_err(|e| {
                Diagnostic::error(format!(
                    "invalid for_each for {}.{}",
                    resource.r#type, resource.name
                ))
                .with_detail(e.to_string())
            })?;
            if collection.contains_unknown() {
                return Ok(Expansion::Deferred);
            }
            let keys = match &collection.kind {
                ValueKind::Map(m) | ValueKind::Object(m) => m.keys().cloned().collect(),
                ValueKind::Set(items) | ValueKind::List(items) | ValueKind::Tuple(items) => {
                    let mut keys = Vec::new();
                    for item in items {
                        match item.as_str() {
                            Some(s) => keys.push(s.to_string()),
                            None => {
                                return Err(Diagnostic::error(format!(
                                    "for_each for {}.{} needs a map or set of strings",
                                    resource.r#type, resource.name
                                )))
                            }
                        }
                    }
                    keys
                }
                _ => {
                    return Err(Diagnostic::error(format!(
                        "for_each for {}.{} needs a map or set of strings",
                        resource.r#type, resource.name
                    )))
                }
            };
            return Ok(Expansion::ForEach(keys));
        }
        Ok(Expansion::Single)
    }

    /// References and depends_on targets, as instance address strings.
    fn dependencies_for(
        &self,
        path: &ModulePath,
        key: &str,
        resource: &ResourceConfig,
    ) -> Vec<String> {
        let module = self.module(path);
        let mut out = Vec::new();
        let mut push_resource = |res_key: &str| {
            if let Some(addrs) = self.instances_of.get(&(path.clone(), res_key.to_string())) {
                out.extend(addrs.iter().map(|a| a.to_string()));
            }
        };

        for expr in resource
            .body
            .values()
            .chain(resource.count.iter())
            .chain(resource.for_each.iter())
        {
            for reference in crate::eval::references(expr) {
                let segments = &reference.0;
                let candidate = match reference.root() {
                    "data" => match (segments.get(1), segments.get(2)) {
                        (Some(ty), Some(name)) => Some(format!("data.{}.{}", ty, name)),
                        _ => None,
                    },
                    "var" | "local" | "module" | "each" | "count" | "self" | "path" => None,
                    ty => segments.get(1).map(|name| format!("{}.{}", ty, name)),
                };
                if let Some(candidate) = candidate {
                    if candidate != key && module.resources.contains_key(&candidate) {
                        push_resource(&candidate);
                    }
                }
            }
        }
        for target in resource
            .depends_on
            .iter()
            .chain(&resource.lifecycle.replace_triggered_by)
        {
            if module.resources.contains_key(target) {
                push_resource(target);
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// True if any planned change of the referenced resources is not a
    /// no-op.
    fn triggers_fired(&self, path: &ModulePath, resource: &ResourceConfig) -> bool {
        resource.lifecycle.replace_triggered_by.iter().any(|target| {
            self.instances_of
                .get(&(path.clone(), target.clone()))
                .into_iter()
                .flatten()
                .any(|addr| {
                    self.plan
                        .change_for(addr)
                        .map(|c| !c.action.is_no_op())
                        .unwrap_or(false)
                })
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_instance(
        &mut self,
        path: &ModulePath,
        resource: &ResourceConfig,
        address: &InstanceAddr,
        block: &BlockSchema,
        schema_version: u64,
        provider_name: &str,
        client: &dyn crate::provider::ProviderOps,
        dependencies: &[String],
        expansion: &Expansion,
    ) -> Result<Value> {
        // Instance-local scope: each.* / count.index.
        let mut scope = self.scope(path).clone();
        match &address.key {
            InstanceKey::Index(i) => scope.count_index = Some(*i),
            InstanceKey::Key(k) => {
                let each_value = match expansion {
                    Expansion::ForEach(_) => {
                        match resource
                            .for_each
                            .as_ref()
                            .and_then(|e| evaluate(e, &scope).ok())
                        {
                            Some(collection) => collection
                                .value_at(&Path::attr(k.clone()))
                                .cloned()
                                .unwrap_or_else(|| Value::string(k.clone())),
                            None => Value::string(k.clone()),
                        }
                    }
                    _ => Value::string(k.clone()),
                };
                scope.each = Some((Value::string(k.clone()), each_value));
            }
            InstanceKey::None => {}
        }

        // Evaluate the configuration body, converting each attribute to its
        // schema type.
        let mut config_attrs = BTreeMap::new();
        for (attr, expr) in &resource.body {
            let value = match evaluate(expr, &scope) {
                Ok(v) => v,
                Err(e) => {
                    self.diags.push(
                        Diagnostic::error(format!("invalid value for {}.{}", address, attr))
                            .with_detail(e.to_string())
                            .with_range(resource.range.clone()),
                    );
                    return Ok(Value::unknown(block.implied_type()));
                }
            };
            let value = match block.attributes.get(attr) {
                Some(schema_attr) => match convert(&value, &schema_attr.r#type) {
                    Ok(v) => v,
                    Err(e) => {
                        self.diags.push(
                            Diagnostic::error(format!(
                                "invalid value for {}.{}: {}",
                                address, attr, e
                            ))
                            .with_range(resource.range.clone()),
                        );
                        return Ok(Value::unknown(block.implied_type()));
                    }
                },
                None => value,
            };
            config_attrs.insert(attr.clone(), value);
        }
        // Schema completion: missing attributes become null.
        for (attr_name, attr) in &block.attributes {
            if !config_attrs.contains_key(attr_name) {
                if attr.required {
                    self.diags.push(
                        Diagnostic::error(format!(
                            "missing required argument {:?} for {}",
                            attr_name, address
                        ))
                        .with_range(resource.range.clone()),
                    );
                }
                config_attrs.insert(attr_name.clone(), Value::null());
            }
            if attr.sensitive {
                if let Some(v) = config_attrs.get_mut(attr_name) {
                    *v = v.clone().mark_sensitive();
                }
            }
        }
        let config_value = Value::object(config_attrs);

        // Preconditions gate the rest of the instance plan.
        for cond in &resource.preconditions {
            self.run_condition(address, &scope, cond, CheckKind::Resource);
        }

        let diagnostics = client
            .validate_resource_config(&resource.r#type, &config_value)
            .await
            .with_context(|| format!("validating {}", address))?;
        let mut had_error = false;
        for d in diagnostics {
            had_error |= d.severity == groundwork_core::diag::Severity::Error;
            self.diags.push(d);
        }
        if had_error {
            return Ok(Value::unknown(block.implied_type()));
        }

        // Load and upgrade prior state.
        let prior_instance = self.state.get(address, None).cloned();
        let mut prior_value = match &prior_instance {
            Some(instance) => {
                if instance.schema_version < schema_version {
                    Some(
                        client
                            .upgrade_resource_state(
                                &resource.r#type,
                                &instance.attributes,
                                instance.schema_version,
                            )
                            .await
                            .with_context(|| format!("upgrading state of {}", address))?,
                    )
                } else {
                    Some(instance.value(&block.implied_type()))
                }
            }
            None => None,
        };

        // Data resources read during plan, or defer.
        if resource.mode == ResourceMode::Data {
            return self
                .plan_data_instance(
                    resource,
                    address,
                    block,
                    schema_version,
                    provider_name,
                    client,
                    dependencies,
                    config_value,
                )
                .await;
        }

        // Refresh phase: observe the live object and record drift.
        if self.options.refresh {
            if let (Some(instance), Some(prior)) = (&prior_instance, &prior_value) {
                let read = client
                    .read_resource(&resource.r#type, prior, instance.private.as_deref())
                    .await
                    .with_context(|| format!("refreshing {}", address))?;
                let refreshed = read.new_state;
                let drifted = match &refreshed {
                    Some(new) => new.without_marks() != prior.without_marks(),
                    None => true,
                };
                if drifted {
                    self.plan.resource_drift.push(ResourceChange {
                        address: address.clone(),
                        previous_address: None,
                        deposed: None,
                        type_name: resource.r#type.clone(),
                        provider: provider_name.to_string(),
                        schema_version,
                        action: match &refreshed {
                            Some(_) => Action::Update,
                            None => Action::Delete,
                        },
                        action_reason: None,
                        before: Some(WireValue::from_value(prior)),
                        after: refreshed.as_ref().map(WireValue::from_value),
                        replace_paths: Vec::new(),
                        deferred: None,
                        private: None,
                        importing: None,
                        generated_config: None,
                        dependencies: Vec::new(),
                        create_before_destroy: false,
                    });
                    prior_value = refreshed.clone();
                    // The refreshed view becomes the prior for this run.
                    match refreshed {
                        Some(new) => {
                            let mut updated = instance.clone();
                            updated.attributes = new.to_wire_json();
                            updated.sensitive_paths = new.sensitive_paths();
                            self.state.put(updated);
                        }
                        None => {
                            self.state.remove(address, None);
                        }
                    }
                }
            }
        }

        if self.options.mode == PlanMode::RefreshOnly {
            return Ok(prior_value.unwrap_or_else(|| Value::unknown(block.implied_type())));
        }

        if self.options.mode == PlanMode::Destroy {
            if let Some(prior) = &prior_value {
                self.push_delete(
                    address.clone(),
                    None,
                    resource,
                    provider_name,
                    schema_version,
                    prior,
                    None,
                    dependencies.to_vec(),
                );
            }
            return Ok(prior_value.unwrap_or_else(Value::null));
        }

        // Forget takes priority over planning a real change.
        if self.options.forget.iter().any(|t| t == &address.to_string()) {
            if prior_value.is_some() {
                self.plan.resource_changes.push(ResourceChange {
                    address: address.clone(),
                    previous_address: None,
                    deposed: None,
                    type_name: resource.r#type.clone(),
                    provider: provider_name.to_string(),
                    schema_version,
                    action: Action::Forget,
                    action_reason: None,
                    before: prior_value.as_ref().map(WireValue::from_value),
                    after: None,
                    replace_paths: Vec::new(),
                    deferred: None,
                    private: None,
                    importing: None,
                    generated_config: None,
                    dependencies: dependencies.to_vec(),
                    create_before_destroy: false,
                });
            }
            return Ok(prior_value.unwrap_or_else(Value::null));
        }

        // Propose: prior merged with config, honoring ignore_changes.
        let mut proposed = config_value.clone();
        if let Some(prior) = &prior_value {
            // Computed attributes keep their prior observation when the
            // config does not set them.
            for (attr_name, attr) in &block.attributes {
                if attr.computed {
                    let p = Path::attr(attr_name.clone());
                    let config_is_null = config_value
                        .value_at(&p)
                        .map(|v| v.is_null())
                        .unwrap_or(true);
                    if config_is_null {
                        if let Some(prior_attr) = prior.value_at(&p) {
                            proposed.set_at(&p, prior_attr.clone());
                        }
                    }
                }
            }
            for ignored in &resource.lifecycle.ignore_changes {
                let p = parse_attr_path(ignored);
                if let Some(prior_attr) = prior.value_at(&p) {
                    proposed.set_at(&p, prior_attr.clone());
                }
            }
        } else {
            // Unset computed attributes are unknown until apply.
            for (attr_name, attr) in &block.attributes {
                if attr.computed {
                    let p = Path::attr(attr_name.clone());
                    let is_null = proposed.value_at(&p).map(|v| v.is_null()).unwrap_or(true);
                    if is_null {
                        proposed.set_at(&p, Value::unknown(attr.r#type.clone()));
                    }
                }
            }
        }

        let prior_for_provider = prior_value.clone().unwrap_or_else(Value::null);
        let planned = client
            .plan_resource_change(&resource.r#type, &config_value, &prior_for_provider, &proposed)
            .await
            .with_context(|| format!("planning {}", address))?;

        if let Some(deferred) = planned.deferred {
            self.plan.resource_changes.push(ResourceChange {
                address: address.clone(),
                previous_address: None,
                deposed: None,
                type_name: resource.r#type.clone(),
                provider: provider_name.to_string(),
                schema_version,
                action: Action::NoOp,
                action_reason: Some(ActionReason::ReadBecauseConfigUnknown),
                before: prior_value.as_ref().map(WireValue::from_value),
                after: None,
                replace_paths: Vec::new(),
                deferred: Some(deferred.reason),
                private: planned.private,
                importing: None,
                generated_config: None,
                dependencies: dependencies.to_vec(),
                create_before_destroy: resource.lifecycle.create_before_destroy,
            });
            return Ok(Value::unknown(block.implied_type()));
        }

        let planned_value = planned.planned_state;

        // Action selection.
        let (action, reason, replace_paths) = match &prior_value {
            None => (Action::Create, None, Vec::new()),
            Some(prior) => {
                let tainted = prior_instance.as_ref().map(|i| i.tainted).unwrap_or(false);
                let requested = self
                    .options
                    .replace
                    .iter()
                    .any(|t| t == &address.to_string());
                let triggered = self.triggers_fired(path, resource);
                let changed = planned_value.without_marks() != prior.without_marks();

                if tainted {
                    (
                        replace_action(resource),
                        Some(ActionReason::ReplaceBecauseTainted),
                        planned.requires_replace.clone(),
                    )
                } else if requested {
                    (
                        replace_action(resource),
                        Some(ActionReason::ReplaceByRequest),
                        planned.requires_replace.clone(),
                    )
                } else if triggered {
                    (
                        replace_action(resource),
                        Some(ActionReason::ReplaceByTriggers),
                        planned.requires_replace.clone(),
                    )
                } else if changed && !planned.requires_replace.is_empty() {
                    (
                        replace_action(resource),
                        Some(ActionReason::ReplaceBecauseCannotUpdate),
                        planned.requires_replace.clone(),
                    )
                } else if changed {
                    (Action::Update, None, Vec::new())
                } else {
                    (Action::NoOp, None, Vec::new())
                }
            }
        };

        if resource.lifecycle.prevent_destroy
            && (action == Action::Delete || action.is_replace())
        {
            self.diags.push(
                Diagnostic::error(format!(
                    "{} has prevent_destroy set but the plan requires replacing it",
                    address
                ))
                .with_range(resource.range.clone()),
            );
        }

        // Postconditions check against the planned object.
        let mut post_scope = scope.clone();
        post_scope.self_value = Some(planned_value.clone());
        for cond in &resource.postconditions {
            self.run_condition(address, &post_scope, cond, CheckKind::Resource);
        }

        self.plan.resource_changes.push(ResourceChange {
            address: address.clone(),
            previous_address: None,
            deposed: None,
            type_name: resource.r#type.clone(),
            provider: provider_name.to_string(),
            schema_version,
            action,
            action_reason: reason,
            before: prior_value.as_ref().map(WireValue::from_value),
            after: match action {
                Action::Delete | Action::Forget => None,
                _ => Some(WireValue::from_value(&planned_value)),
            },
            replace_paths,
            deferred: None,
            private: planned.private,
            importing: None,
            generated_config: None,
            dependencies: dependencies.to_vec(),
            create_before_destroy: resource.lifecycle.create_before_destroy,
        });

        // Deposed leftovers from earlier interrupted replaces retry.
        let deposed_list: Vec<ResourceInstanceState> = self
            .state
            .deposed_of(address)
            .into_iter()
            .cloned()
            .collect();
        for deposed in deposed_list {
            let before = deposed.value(&block.implied_type());
            self.push_delete(
                address.clone(),
                deposed.deposed.clone(),
                resource,
                provider_name,
                schema_version,
                &before,
                None,
                Vec::new(),
            );
        }

        Ok(match action {
            Action::NoOp | Action::Update => planned_value,
            _ => planned_value,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_data_instance(
        &mut self,
        resource: &ResourceConfig,
        address: &InstanceAddr,
        block: &BlockSchema,
        schema_version: u64,
        provider_name: &str,
        client: &dyn crate::provider::ProviderOps,
        dependencies: &[String],
        config_value: Value,
    ) -> Result<Value> {
        let mut read_reason = None;
        if config_value.contains_unknown() {
            read_reason = Some(ActionReason::ReadBecauseConfigUnknown);
        } else if self.dependency_changes_pending(dependencies) {
            read_reason = Some(ActionReason::ReadBecauseDependencyPending);
        }

        if let Some(reason) = read_reason {
            self.plan.resource_changes.push(ResourceChange {
                address: address.clone(),
                previous_address: None,
                deposed: None,
                type_name: resource.r#type.clone(),
                provider: provider_name.to_string(),
                schema_version,
                action: Action::Read,
                action_reason: Some(reason),
                before: None,
                after: Some(WireValue::from_value(&config_value)),
                replace_paths: Vec::new(),
                deferred: None,
                private: None,
                importing: None,
                generated_config: None,
                dependencies: dependencies.to_vec(),
                create_before_destroy: false,
            });
            return Ok(Value::unknown(block.implied_type()));
        }

        let read = client
            .read_resource(&resource.r#type, &config_value, None)
            .await
            .with_context(|| format!("reading {}", address))?;
        let value = read
            .new_state
            .unwrap_or_else(|| Value::unknown(block.implied_type()));
        self.state.put(ResourceInstanceState {
            address: address.clone(),
            deposed: None,
            schema_version,
            attributes: value.to_wire_json(),
            sensitive_paths: value.sensitive_paths(),
            private: read.private,
            dependencies: dependencies.to_vec(),
            tainted: false,
            create_before_destroy: false,
            provider: provider_name.to_string(),
        });
        Ok(value)
    }

    fn dependency_changes_pending(&self, dependencies: &[String]) -> bool {
        self.plan.resource_changes.iter().any(|c| {
            !c.action.is_no_op() && dependencies.iter().any(|d| d == &c.address.to_string())
        })
    }

    fn run_condition(
        &mut self,
        address: &InstanceAddr,
        scope: &Scope,
        cond: &crate::config::Condition,
        kind: CheckKind,
    ) {
        let (status, problem) = match evaluate(&cond.condition, scope) {
            Ok(v) if v.is_unknown() => (CheckStatus::Unknown, None),
            Ok(v) => match v.as_bool() {
                Some(true) => (CheckStatus::Pass, None),
                _ => {
                    let message = evaluate(&cond.error_message, scope)
                        .ok()
                        .and_then(|m| m.as_str().map(String::from))
                        .unwrap_or_else(|| "condition failed".to_string());
                    (CheckStatus::Fail, Some(message))
                }
            },
            Err(e) => (CheckStatus::Error, Some(e.to_string())),
        };
        if let Some(problem) = &problem {
            self.diags.push(
                Diagnostic::error(format!("condition failed for {}", address))
                    .with_detail(problem.clone()),
            );
        }
        self.plan.checks.push(CheckResult {
            kind,
            address: address.to_string(),
            status,
            problems: problem.into_iter().collect(),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn push_delete(
        &mut self,
        address: InstanceAddr,
        deposed: Option<String>,
        resource: &ResourceConfig,
        provider_name: &str,
        schema_version: u64,
        before: &Value,
        reason: Option<ActionReason>,
        dependencies: Vec<String>,
    ) {
        if resource.lifecycle.prevent_destroy && deposed.is_none() {
            self.diags.push(
                Diagnostic::error(format!(
                    "{} has prevent_destroy set and cannot be destroyed",
                    address
                ))
                .with_range(resource.range.clone()),
            );
        }
        self.plan.resource_changes.push(ResourceChange {
            address,
            previous_address: None,
            deposed,
            type_name: resource.r#type.clone(),
            provider: provider_name.to_string(),
            schema_version,
            action: Action::Delete,
            action_reason: reason,
            before: Some(WireValue::from_value(before)),
            after: None,
            replace_paths: Vec::new(),
            deferred: None,
            private: None,
            importing: None,
            generated_config: None,
            dependencies,
            create_before_destroy: false,
        });
    }

    /// Orphans of a still-configured resource: state keys outside the
    /// current expansion.
    fn plan_repetition_orphans(
        &mut self,
        addr_base: &groundwork_core::addr::ResourceAddr,
        keys: &[InstanceKey],
        resource: &ResourceConfig,
        provider_name: &str,
        schema_version: u64,
    ) {
        if self.options.mode != PlanMode::Normal {
            return;
        }
        let orphans: Vec<ResourceInstanceState> = self
            .state
            .resources
            .iter()
            .filter(|r| {
                r.address.resource == *addr_base
                    && r.deposed.is_none()
                    && !keys.contains(&r.address.key)
            })
            .cloned()
            .collect();
        for orphan in orphans {
            let reason = match (&orphan.address.key, resource.count.is_some(), resource.for_each.is_some()) {
                (InstanceKey::Index(_), true, _) => ActionReason::DeleteBecauseCountIndex,
                (InstanceKey::Key(_), _, true) => ActionReason::DeleteBecauseEachKey,
                _ => ActionReason::DeleteBecauseWrongRepetition,
            };
            let before = orphan.value(&Type::Any);
            self.push_delete(
                orphan.address.clone(),
                None,
                resource,
                provider_name,
                schema_version,
                &before,
                Some(reason),
                Vec::new(),
            );
        }
    }

    /// State entries whose configuration is gone entirely.
    fn sweep_orphans(&mut self) {
        if self.options.mode != PlanMode::Normal {
            return;
        }
        let planned: std::collections::BTreeSet<(InstanceAddr, Option<String>)> = self
            .plan
            .resource_changes
            .iter()
            .map(|c| (c.address.clone(), c.deposed.clone()))
            .collect();

        let orphans: Vec<ResourceInstanceState> = self
            .state
            .resources
            .iter()
            .filter(|r| {
                r.address.resource.mode == ResourceMode::Managed
                    && !planned.contains(&(r.address.clone(), r.deposed.clone()))
            })
            .cloned()
            .collect();

        for orphan in orphans {
            let module_exists = self
                .config
                .root
                .descendant(&orphan.address.resource.module)
                .is_some();
            let resource_exists = module_exists
                && self
                    .config
                    .root
                    .descendant(&orphan.address.resource.module)
                    .map(|m| {
                        m.resources.contains_key(&Module::resource_key(
                            orphan.address.resource.mode,
                            &orphan.address.resource.r#type,
                            &orphan.address.resource.name,
                        ))
                    })
                    .unwrap_or(false);
            if resource_exists && orphan.deposed.is_none() {
                // Covered by repetition-orphan planning already.
                continue;
            }
            let reason = if orphan.deposed.is_some() {
                None
            } else if !module_exists {
                Some(ActionReason::DeleteBecauseNoModule)
            } else {
                Some(ActionReason::DeleteBecauseNoResourceConfig)
            };
            self.plan.resource_changes.push(ResourceChange {
                address: orphan.address.clone(),
                previous_address: None,
                deposed: orphan.deposed.clone(),
                type_name: orphan.address.resource.r#type.clone(),
                provider: orphan.provider.clone(),
                schema_version: orphan.schema_version,
                action: Action::Delete,
                action_reason: reason,
                before: Some(WireValue {
                    json: orphan.attributes.clone(),
                    unknown: Vec::new(),
                    sensitive: orphan.sensitive_paths.clone(),
                }),
                after: None,
                replace_paths: Vec::new(),
                deferred: None,
                private: orphan.private.clone(),
                importing: None,
                generated_config: None,
                dependencies: Vec::new(),
                create_before_destroy: orphan.create_before_destroy,
            });
        }
    }

    fn plan_output_changes(&mut self) {
        let new_outputs = self
            .module_outputs
            .get(&ModulePath::root())
            .cloned()
            .unwrap_or_default();
        let root_config = &self.config.root;
        let prior = &self.plan.prior_state.outputs;

        let mut names: std::collections::BTreeSet<String> = prior.keys().cloned().collect();
        names.extend(new_outputs.keys().cloned());

        for name in names {
            let before = prior.get(&name);
            let after = if self.options.mode == PlanMode::Destroy {
                None
            } else {
                new_outputs.get(&name)
            };
            let declared_sensitive = root_config
                .outputs
                .get(&name)
                .map(|o| o.sensitive)
                .unwrap_or(false);
            let (action, sensitive) = match (before, after) {
                (None, Some(a)) => (Action::Create, declared_sensitive || a.contains_sensitive()),
                (Some(_), None) => (Action::Delete, declared_sensitive),
                (Some(b), Some(a)) => {
                    let before_value =
                        Value::from_wire(&b.value, &b.r#type, &[], &[]);
                    if before_value.without_marks() == a.without_marks() {
                        (Action::NoOp, declared_sensitive)
                    } else {
                        (Action::Update, declared_sensitive || a.contains_sensitive())
                    }
                }
                (None, None) => continue,
            };
            self.plan.output_changes.insert(
                name.clone(),
                OutputChange {
                    action,
                    before: before.map(|b| WireValue {
                        json: b.value.clone(),
                        unknown: Vec::new(),
                        sensitive: Vec::new(),
                    }),
                    after: after.map(WireValue::from_value),
                    sensitive,
                },
            );
        }
    }

    /// Prunes changes outside the requested targets, keeping transitive
    /// dependencies of kept changes.
    fn apply_target_filter(&mut self) {
        if self.options.targets.is_empty() {
            return;
        }
        let matches = |addr: &InstanceAddr| {
            let s = addr.to_string();
            self.options
                .targets
                .iter()
                .any(|t| s == *t || s.starts_with(&format!("{}[", t)) || s.starts_with(&format!("{}.", t)))
        };

        let mut kept: std::collections::BTreeSet<String> = self
            .plan
            .resource_changes
            .iter()
            .filter(|c| matches(&c.address))
            .map(|c| c.address.to_string())
            .collect();

        // Close over dependencies.
        loop {
            let mut grew = false;
            for change in &self.plan.resource_changes {
                if kept.contains(&change.address.to_string()) {
                    for dep in &change.dependencies {
                        grew |= kept.insert(dep.clone());
                    }
                }
            }
            if !grew {
                break;
            }
        }

        self.plan
            .resource_changes
            .retain(|c| kept.contains(&c.address.to_string()));
    }
}

#[derive(Debug, Clone)]
enum Expansion {
    Single,
    Count(usize),
    ForEach(Vec<String>),
    Deferred,
}

fn replace_action(resource: &ResourceConfig) -> Action {
    if resource.lifecycle.create_before_destroy {
        Action::CreateThenDelete
    } else {
        Action::DeleteThenCreate
    }
}

/// Parses an `ignore_changes` entry like `triggers` or `triggers.x`.
fn parse_attr_path(raw: &str) -> Path {
    Path(
        raw.split('.')
            .map(|part| match part.parse::<usize>() {
                Ok(i) => PathStep::Index(i),
                Err(_) => PathStep::Attr(part.to_string()),
            })
            .collect(),
    )
}

#[cfg(test)]
pub(crate) mod tests;
