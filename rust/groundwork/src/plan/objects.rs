//! Plan data model and its external JSON rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use groundwork_core::addr::{InstanceAddr, InstanceKey, ResourceMode};
use groundwork_core::types::Type;
use groundwork_core::value::{Path, Value};
use groundwork_provider::schema::v1::{DeferredReason, WireValue};
use serde::{Deserialize, Serialize};

use crate::state::State;

pub const PLAN_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanMode {
    Normal,
    RefreshOnly,
    Destroy,
}

impl Default for PlanMode {
    fn default() -> Self {
        PlanMode::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NoOp,
    Create,
    Read,
    Update,
    Delete,
    /// Replace, creating the successor before destroying the predecessor.
    CreateThenDelete,
    /// Replace, destroying the predecessor first.
    DeleteThenCreate,
    /// Remove from state without destroying the remote object.
    Forget,
}

impl Action {
    pub fn is_replace(&self) -> bool {
        matches!(self, Action::CreateThenDelete | Action::DeleteThenCreate)
    }

    pub fn is_no_op(&self) -> bool {
        matches!(self, Action::NoOp)
    }

    /// The `actions` array of the external change representation.
    pub fn json_actions(&self) -> Vec<&'static str> {
        match self {
            Action::NoOp => vec!["no-op"],
            Action::Create => vec!["create"],
            Action::Read => vec!["read"],
            Action::Update => vec!["update"],
            Action::Delete => vec!["delete"],
            Action::CreateThenDelete => vec!["create", "delete"],
            Action::DeleteThenCreate => vec!["delete", "create"],
            Action::Forget => vec!["forget"],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionReason {
    ReplaceBecauseTainted,
    ReplaceBecauseCannotUpdate,
    ReplaceByRequest,
    ReplaceByTriggers,
    DeleteBecauseNoResourceConfig,
    DeleteBecauseNoModule,
    DeleteBecauseWrongRepetition,
    DeleteBecauseCountIndex,
    DeleteBecauseEachKey,
    DeleteBecauseNoMoveTarget,
    ReadBecauseConfigUnknown,
    ReadBecauseDependencyPending,
    ReadBecauseCheckNested,
}

/// One planned resource instance change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub address: InstanceAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_address: Option<InstanceAddr>,
    /// Set when this change destroys a deposed predecessor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    pub type_name: String,
    pub provider: String,
    pub schema_version: u64,
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_reason: Option<ActionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replace_paths: Vec<Path>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<DeferredReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_config: Option<String>,
    /// Instance addresses this change must wait for during apply.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
}

impl ResourceChange {
    pub fn before_value(&self) -> Option<Value> {
        self.before.as_ref().map(|w| w.to_value(&Type::Any))
    }

    pub fn after_value(&self) -> Option<Value> {
        self.after.as_ref().map(|w| w.to_value(&Type::Any))
    }

    /// External change representation.
    pub fn to_json(&self) -> serde_json::Value {
        let null = || serde_json::Value::Null;
        let marks = |w: &Option<WireValue>, pred: fn(&Value) -> bool| match w {
            Some(w) => w.to_value(&Type::Any).mark_structure(&pred),
            None => serde_json::Value::Bool(false),
        };

        let mut change = serde_json::json!({
            "actions": self.action.json_actions(),
            "before": self.before.as_ref().map(|w| w.json.clone()).unwrap_or_else(null),
            "after": self.after.as_ref().map(|w| w.json.clone()).unwrap_or_else(null),
            "after_unknown": marks(&self.after, |v| v.is_unknown()),
            "before_sensitive": marks(&self.before, |v| v.marks.sensitive),
            "after_sensitive": marks(&self.after, |v| v.marks.sensitive),
        });
        if !self.replace_paths.is_empty() {
            change["replace_paths"] = serde_json::to_value(&self.replace_paths).unwrap_or_default();
        }
        if let Some(importing) = &self.importing {
            change["importing"] = serde_json::json!({ "id": importing });
        }
        if let Some(generated) = &self.generated_config {
            change["generated_config"] = serde_json::json!(generated);
        }

        let mut out = serde_json::json!({
            "address": self.address.to_string(),
            "mode": match self.address.resource.mode {
                ResourceMode::Managed => "managed",
                ResourceMode::Data => "data",
            },
            "type": self.type_name,
            "name": self.address.resource.name,
            "provider_name": self.provider,
            "change": change,
        });
        match &self.address.key {
            InstanceKey::None => {}
            InstanceKey::Index(i) => out["index"] = serde_json::json!(i),
            InstanceKey::Key(k) => out["index"] = serde_json::json!(k),
        }
        if let Some(deposed) = &self.deposed {
            out["deposed"] = serde_json::json!(deposed);
        }
        if let Some(reason) = &self.action_reason {
            out["action_reason"] = serde_json::to_value(reason).unwrap_or_default();
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChange {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<WireValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<WireValue>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Resource,
    OutputValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub kind: CheckKind,
    pub address: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub format_version: String,
    pub mode: PlanMode,
    pub prior_state: State,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub resource_changes: Vec<ResourceChange>,
    pub output_changes: BTreeMap<String, OutputChange>,
    /// Changes observed between recorded state and the provider's current
    /// view during refresh.
    pub resource_drift: Vec<ResourceChange>,
    pub checks: Vec<CheckResult>,
    pub errored: bool,
    pub timestamp: DateTime<Utc>,
}

impl Plan {
    pub fn new(mode: PlanMode, prior_state: State) -> Plan {
        Plan {
            format_version: PLAN_FORMAT_VERSION.to_string(),
            mode,
            prior_state,
            variables: BTreeMap::new(),
            resource_changes: Vec::new(),
            output_changes: BTreeMap::new(),
            resource_drift: Vec::new(),
            checks: Vec::new(),
            errored: false,
            timestamp: Utc::now(),
        }
    }

    /// True if applying this plan would change anything.
    pub fn has_changes(&self) -> bool {
        self.resource_changes.iter().any(|c| !c.action.is_no_op())
            || self
                .output_changes
                .values()
                .any(|c| !c.action.is_no_op())
    }

    pub fn applyable(&self) -> bool {
        !self.errored && self.mode != PlanMode::RefreshOnly
    }

    pub fn change_for(&self, address: &InstanceAddr) -> Option<&ResourceChange> {
        self.resource_changes
            .iter()
            .find(|c| &c.address == address && c.deposed.is_none())
    }

    /// External JSON plan representation.
    pub fn to_external_json(&self) -> serde_json::Value {
        let checks: Vec<serde_json::Value> = self
            .checks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "address": { "kind": c.kind, "to_display": c.address },
                    "status": c.status,
                    "instances": c.problems.iter().map(|p| {
                        serde_json::json!({"problems": [{"message": p}]})
                    }).collect::<Vec<_>>(),
                })
            })
            .collect();

        serde_json::json!({
            "format_version": self.format_version,
            "timestamp": self.timestamp.to_rfc3339(),
            "errored": self.errored,
            "variables": self.variables.iter().map(|(k, v)| {
                (k.clone(), serde_json::json!({"value": v}))
            }).collect::<serde_json::Map<_, _>>(),
            "resource_changes": self
                .resource_changes
                .iter()
                .map(|c| c.to_json())
                .collect::<Vec<_>>(),
            "resource_drift": self
                .resource_drift
                .iter()
                .map(|c| c.to_json())
                .collect::<Vec<_>>(),
            "output_changes": self.output_changes.iter().map(|(name, c)| {
                (name.clone(), serde_json::json!({
                    "actions": c.action.json_actions(),
                    "before": c.before.as_ref().map(|w| w.json.clone()),
                    "after": c.after.as_ref().map(|w| w.json.clone()),
                    "after_unknown": c.after.as_ref()
                        .map(|w| w.to_value(&Type::Any).mark_structure(&|v| v.is_unknown()))
                        .unwrap_or(serde_json::Value::Bool(false)),
                    "before_sensitive": serde_json::Value::Bool(c.sensitive),
                    "after_sensitive": serde_json::Value::Bool(c.sensitive),
                }))
            }).collect::<serde_json::Map<_, _>>(),
            "checks": checks,
        })
    }
}
