//! The configuration-object graph: one node per variable, local, provider
//! configuration, resource block, output and module call, with edges from
//! static reference extraction and explicit `depends_on`.
//!
//! The plan engine walks this graph in topological order to evaluate
//! expressions; instance expansion happens during that walk.

use std::fmt::Display;

use groundwork_core::addr::ModulePath;
use hcl::Expression;

use super::Graph;
use crate::config::{Config, Module};
use crate::eval::references;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigNode {
    Variable(ModulePath, String),
    Local(ModulePath, String),
    Provider(ModulePath, String),
    /// Resource or data block, keyed as in [`Module::resources`].
    Resource(ModulePath, String),
    Output(ModulePath, String),
    ModuleCall(ModulePath, String),
}

impl Display for ConfigNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (module, kind, name) = match self {
            ConfigNode::Variable(m, n) => (m, "var", n),
            ConfigNode::Local(m, n) => (m, "local", n),
            ConfigNode::Provider(m, n) => (m, "provider", n),
            ConfigNode::Resource(m, n) => {
                if m.is_root() {
                    return write!(f, "{}", n);
                }
                return write!(f, "{}.{}", m, n);
            }
            ConfigNode::Output(m, n) => (m, "output", n),
            ConfigNode::ModuleCall(m, n) => (m, "module", n),
        };
        if module.is_root() {
            write!(f, "{}.{}", kind, name)
        } else {
            write!(f, "{}.{}.{}", module, kind, name)
        }
    }
}

/// Builds the graph for a whole module tree.
pub fn build(config: &Config) -> Graph<ConfigNode> {
    let mut graph = Graph::new();
    add_module(&mut graph, &config.root);
    graph
}

fn add_module(graph: &mut Graph<ConfigNode>, module: &Module) {
    let path = &module.path;

    for name in module.variables.keys() {
        graph.add_node(ConfigNode::Variable(path.clone(), name.clone()));
    }
    for name in module.providers.keys() {
        graph.add_node(ConfigNode::Provider(path.clone(), name.clone()));
    }

    for (name, expr) in &module.locals {
        let node = ConfigNode::Local(path.clone(), name.clone());
        graph.add_node(node.clone());
        add_expr_edges(graph, module, &node, expr);
    }

    for (key, resource) in &module.resources {
        let node = ConfigNode::Resource(path.clone(), key.clone());
        graph.add_node(node.clone());

        // Every resource depends on its provider configuration, when one is
        // declared in this module.
        let provider = resource.provider_local_name();
        if module.providers.contains_key(provider) {
            graph.add_dependency(
                node.clone(),
                ConfigNode::Provider(path.clone(), provider.to_string()),
            );
        }

        for expr in resource.body.values() {
            add_expr_edges(graph, module, &node, expr);
        }
        for expr in resource.count.iter().chain(resource.for_each.iter()) {
            add_expr_edges(graph, module, &node, expr);
        }
        for cond in resource.preconditions.iter().chain(&resource.postconditions) {
            add_expr_edges(graph, module, &node, &cond.condition);
            add_expr_edges(graph, module, &node, &cond.error_message);
        }
        for target in &resource.depends_on {
            if let Some(dep) = resource_node_for(module, target) {
                graph.add_dependency(node.clone(), dep);
            }
        }
        for target in &resource.lifecycle.replace_triggered_by {
            if let Some(dep) = resource_node_for(module, target) {
                graph.add_dependency(node.clone(), dep);
            }
        }
    }

    for (name, output) in &module.outputs {
        let node = ConfigNode::Output(path.clone(), name.clone());
        graph.add_node(node.clone());
        add_expr_edges(graph, module, &node, &output.value);
        for target in &output.depends_on {
            if let Some(dep) = resource_node_for(module, target) {
                graph.add_dependency(node.clone(), dep);
            }
        }
    }

    for (name, call) in &module.module_calls {
        let call_node = ConfigNode::ModuleCall(path.clone(), name.clone());
        graph.add_node(call_node.clone());
        for expr in call.count.iter().chain(call.for_each.iter()) {
            add_expr_edges(graph, module, &call_node, expr);
        }

        if let Some(child) = module.children.get(name) {
            // Child variables are fed by the call's argument expressions,
            // evaluated in the parent scope. The repetition argument gates
            // the child's expansion, so its references flow in as well.
            for (arg_name, expr) in &call.arguments {
                if child.variables.contains_key(arg_name) {
                    let var_node =
                        ConfigNode::Variable(child.path.clone(), arg_name.clone());
                    graph.add_node(var_node.clone());
                    add_expr_edges(graph, module, &var_node, expr);
                    for rep in call.count.iter().chain(call.for_each.iter()) {
                        add_expr_edges(graph, module, &var_node, rep);
                    }
                }
            }
            // The call completes when the child's outputs are ready.
            for output_name in child.outputs.keys() {
                graph.add_dependency(
                    call_node.clone(),
                    ConfigNode::Output(child.path.clone(), output_name.clone()),
                );
            }
            add_module(graph, child);
        }
    }
}

/// Adds edges for every reference in `expr`, resolved within `module`.
fn add_expr_edges(
    graph: &mut Graph<ConfigNode>,
    module: &Module,
    node: &ConfigNode,
    expr: &Expression,
) {
    let path = &module.path;
    for reference in references(expr) {
        let segments = &reference.0;
        let dep = match reference.root() {
            "var" => segments
                .get(1)
                .map(|n| ConfigNode::Variable(path.clone(), n.clone())),
            "local" => segments
                .get(1)
                .map(|n| ConfigNode::Local(path.clone(), n.clone())),
            "module" => segments
                .get(1)
                .map(|n| ConfigNode::ModuleCall(path.clone(), n.clone())),
            "data" => match (segments.get(1), segments.get(2)) {
                (Some(ty), Some(name)) => Some(ConfigNode::Resource(
                    path.clone(),
                    format!("data.{}.{}", ty, name),
                )),
                _ => None,
            },
            "each" | "count" | "self" | "path" => None,
            ty => {
                let key = segments.get(1).map(|name| format!("{}.{}", ty, name));
                key.filter(|k| module.resources.contains_key(k))
                    .map(|k| ConfigNode::Resource(path.clone(), k))
            }
        };
        if let Some(dep) = dep {
            graph.add_dependency(node.clone(), dep);
        }
    }
}

/// Resolves a `depends_on`/`replace_triggered_by` target like `null.a` or
/// `data.null.b` to its node in `module`.
fn resource_node_for(module: &Module, target: &str) -> Option<ConfigNode> {
    let key = target.to_string();
    if module.resources.contains_key(&key) {
        Some(ConfigNode::Resource(module.path.clone(), key))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    fn load(src: &str) -> Config {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.gw.hcl"), src).unwrap();
        let (config, diags) = config::load_dir(dir.path());
        assert!(!diags.has_errors(), "{:?}", diags);
        config
    }

    #[test]
    fn references_create_edges() {
        let config = load(
            r#"
            variable "name" { type = string }

            resource "null" "a" {
              triggers = { n = var.name }
            }

            resource "null" "b" {
              triggers = { upstream = null.a.id }
            }

            output "b_id" {
              value = null.b.id
            }
            "#,
        );
        let graph = build(&config);
        let order = graph.topo_order().unwrap();
        let pos = |n: &str| {
            order
                .iter()
                .position(|k| k.to_string() == n)
                .unwrap_or_else(|| panic!("{} not in graph", n))
        };
        assert!(pos("var.name") < pos("null.a"));
        assert!(pos("null.a") < pos("null.b"));
        assert!(pos("null.b") < pos("output.b_id"));
    }

    #[test]
    fn depends_on_creates_edges() {
        let config = load(
            r#"
            resource "null" "first" {}
            resource "null" "second" {
              depends_on = ["null.first"]
            }
            "#,
        );
        let graph = build(&config);
        let order = graph.topo_order().unwrap();
        let rendered: Vec<String> = order.iter().map(|k| k.to_string()).collect();
        assert_eq!(rendered, vec!["null.first", "null.second"]);
    }

    #[test]
    fn reference_cycles_are_reported() {
        let config = load(
            r#"
            resource "null" "a" {
              triggers = { x = null.b.id }
            }
            resource "null" "b" {
              triggers = { x = null.a.id }
            }
            "#,
        );
        let graph = build(&config);
        let cycle = graph.topo_order().unwrap_err();
        let rendered = cycle.to_string();
        assert!(rendered.contains("null.a"), "{}", rendered);
        assert!(rendered.contains("null.b"), "{}", rendered);
    }

    #[test]
    fn module_call_wiring() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("net")).unwrap();
        std::fs::write(
            dir.path().join("main.gw.hcl"),
            r#"
            variable "cidr" { type = string }
            module "net" {
              source = "net"
              cidr   = var.cidr
            }
            output "vpc" { value = module.net.vpc_id }
            "#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("net").join("main.gw.hcl"),
            r#"
            variable "cidr" { type = string }
            resource "null" "vpc" { triggers = { cidr = var.cidr } }
            output "vpc_id" { value = null.vpc.id }
            "#,
        )
        .unwrap();
        let (config, diags) = config::load_dir(dir.path());
        assert!(!diags.has_errors(), "{:?}", diags);

        let graph = build(&config);
        let order = graph.topo_order().unwrap();
        let rendered: Vec<String> = order.iter().map(|k| k.to_string()).collect();
        let pos = |n: &str| {
            rendered
                .iter()
                .position(|k| k == n)
                .unwrap_or_else(|| panic!("{} not in {:?}", n, rendered))
        };
        assert!(pos("var.cidr") < pos("module.net.var.cidr"));
        assert!(pos("module.net.var.cidr") < pos("module.net.null.vpc"));
        assert!(pos("module.net.null.vpc") < pos("module.net.output.vpc_id"));
        assert!(pos("module.net.output.vpc_id") < pos("module.net"));
        assert!(pos("module.net") < pos("output.vpc"));
    }
}
