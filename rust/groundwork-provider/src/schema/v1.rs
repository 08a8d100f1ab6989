//! Version 1 of the provider wire protocol.
//!
//! Requests and responses are single JSON lines. Every request carries a
//! client-assigned `id`; the matching response echoes it. Responses may
//! arrive out of order. Only matching engine and provider protocol versions
//! are compatible; no promises are made about this interface across versions.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use groundwork_core::diag::Diagnostic;
use groundwork_core::types::Type;
use groundwork_core::value::{Path, Value};

pub type RequestId = u64;

/// A dynamic value on the wire: plain JSON content (unknowns as null) plus
/// the paths that are unknown or sensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    pub json: Json,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<Path>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive: Vec<Path>,
}

impl Default for WireValue {
    fn default() -> WireValue {
        WireValue::null()
    }
}

impl WireValue {
    pub fn null() -> WireValue {
        WireValue {
            json: Json::Null,
            unknown: Vec::new(),
            sensitive: Vec::new(),
        }
    }

    pub fn from_value(value: &Value) -> WireValue {
        WireValue {
            json: value.to_wire_json(),
            unknown: value.unknown_paths(),
            sensitive: value.sensitive_paths(),
        }
    }

    /// Decodes back into a marked value, shaped by `ty`. The engine calls
    /// this on every provider response so marks are always re-applied, even
    /// if the provider echoed content without them.
    pub fn to_value(&self, ty: &Type) -> Value {
        Value::from_wire(&self.json, ty, &self.unknown, &self.sensitive)
    }

    pub fn is_null(&self) -> bool {
        self.json.is_null() && self.unknown.is_empty()
    }
}

/// Why a provider deferred a change instead of planning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredReason {
    ResourceConfigUnknown,
    ProviderConfigUnknown,
    PrereqAbsent,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deferred {
    pub reason: DeferredReason,
}

/// Schema for a single attribute of a resource or provider block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub r#type: Type,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub computed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AttributeSchema {
    pub fn required(ty: Type) -> AttributeSchema {
        AttributeSchema {
            r#type: ty,
            required: true,
            optional: false,
            computed: false,
            sensitive: false,
            description: None,
        }
    }

    pub fn optional(ty: Type) -> AttributeSchema {
        AttributeSchema {
            required: false,
            optional: true,
            ..AttributeSchema::required(ty)
        }
    }

    pub fn computed(ty: Type) -> AttributeSchema {
        AttributeSchema {
            required: false,
            computed: true,
            ..AttributeSchema::required(ty)
        }
    }
}

/// Schema for one block of attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockSchema {
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl BlockSchema {
    /// The object type implied by this block.
    pub fn implied_type(&self) -> Type {
        let attrs = self
            .attributes
            .iter()
            .map(|(name, attr)| (name.clone(), attr.r#type.clone()))
            .collect();
        let optional = self
            .attributes
            .iter()
            .filter(|(_, attr)| !attr.required)
            .map(|(name, _)| name.clone())
            .collect();
        Type::Object { attrs, optional }
    }

    /// Paths the schema itself declares sensitive.
    pub fn sensitive_paths(&self) -> Vec<Path> {
        self.attributes
            .iter()
            .filter(|(_, attr)| attr.sensitive)
            .map(|(name, _)| Path::attr(name.clone()))
            .collect()
    }
}

/// Schema and version for one resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub block: BlockSchema,
    pub version: u64,
}

/// What a provider server can do beyond the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// The provider cannot serve concurrent requests; the engine must
    /// serialize access.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_reentrant: bool,
    /// The provider wants to participate in planning destroys.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub plan_destroy: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProviderSchema {
    pub provider: BlockSchema,
    pub resource_schemas: BTreeMap<String, ResourceSchema>,
    pub data_schemas: BTreeMap<String, ResourceSchema>,
    #[serde(default)]
    pub server_capabilities: ServerCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestPayload {
    GetSchema,
    ValidateProviderConfig {
        config: WireValue,
    },
    ConfigureProvider {
        config: WireValue,
        engine_version: String,
    },
    ValidateResourceConfig {
        type_name: String,
        config: WireValue,
    },
    UpgradeResourceState {
        type_name: String,
        raw_state: Json,
        schema_version: u64,
    },
    ReadResource {
        type_name: String,
        current_state: WireValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private: Option<String>,
    },
    PlanResourceChange {
        type_name: String,
        config: WireValue,
        prior_state: WireValue,
        proposed_new_state: WireValue,
    },
    ApplyResourceChange {
        type_name: String,
        config: WireValue,
        prior_state: WireValue,
        planned_state: WireValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private: Option<String>,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub payload: RequestPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Schema(ProviderSchema),
    Validated {
        diagnostics: Vec<Diagnostic>,
    },
    Configured,
    UpgradedState {
        state: WireValue,
    },
    ReadResult {
        /// None if the remote object no longer exists.
        new_state: Option<WireValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deferred: Option<Deferred>,
    },
    PlannedChange {
        planned_state: WireValue,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        requires_replace: Vec<Path>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deferred: Option<Deferred>,
    },
    AppliedChange {
        new_state: WireValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        private: Option<String>,
    },
    Stopping,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub payload: ResponsePayload,
}

pub fn request_to_json(request: &Request) -> Result<String> {
    serde_json::to_string(request).map_err(|e| e.into())
}

pub fn request_from_json(s: &str) -> Result<Request> {
    serde_json::from_str(s).map_err(|e| e.into())
}

pub fn response_to_json(response: &Response) -> Result<String> {
    serde_json::to_string(response).map_err(|e| e.into())
}

pub fn response_from_json(s: &str) -> Result<Response> {
    serde_json::from_str(s).map_err(|e| e.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork_core::value::ValueKind;

    fn triggers_schema() -> BlockSchema {
        BlockSchema {
            attributes: [
                (
                    "triggers".to_string(),
                    AttributeSchema::optional(Type::Map(Box::new(Type::String))),
                ),
                (
                    "id".to_string(),
                    AttributeSchema::computed(Type::String),
                ),
            ]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn request_json_round_trip() {
        let req = Request {
            id: 7,
            payload: RequestPayload::PlanResourceChange {
                type_name: "null".to_string(),
                config: WireValue {
                    json: serde_json::json!({"triggers": {"x": "1"}}),
                    unknown: vec![],
                    sensitive: vec![Path::attr("triggers")],
                },
                prior_state: WireValue::null(),
                proposed_new_state: WireValue::null(),
            },
        };
        let s = request_to_json(&req).unwrap();
        assert_eq!(request_from_json(&s).unwrap(), req);
    }

    #[test]
    fn response_json_round_trip() {
        let resp = Response {
            id: 7,
            payload: ResponsePayload::PlannedChange {
                planned_state: WireValue {
                    json: serde_json::json!({"id": null}),
                    unknown: vec![Path::attr("id")],
                    sensitive: vec![],
                },
                requires_replace: vec![Path::attr("triggers")],
                private: None,
                deferred: Some(Deferred {
                    reason: DeferredReason::ResourceConfigUnknown,
                }),
            },
        };
        let s = response_to_json(&resp).unwrap();
        assert_eq!(response_from_json(&s).unwrap(), resp);
    }

    #[test]
    fn wire_value_reapplies_marks() {
        let ty = triggers_schema().implied_type();
        let wire = WireValue {
            json: serde_json::json!({"triggers": {"x": "1"}, "id": null}),
            unknown: vec![Path::attr("id")],
            sensitive: vec![Path::attr("triggers")],
        };
        let v = wire.to_value(&ty);
        assert!(v
            .value_at(&Path::attr("triggers"))
            .unwrap()
            .marks
            .sensitive);
        assert!(v.value_at(&Path::attr("id")).unwrap().is_unknown());

        // And back again.
        let round = WireValue::from_value(&v);
        assert_eq!(round.to_value(&ty), v);
    }

    #[test]
    fn implied_type_marks_non_required_optional() {
        let ty = triggers_schema().implied_type();
        match ty {
            Type::Object { attrs, optional } => {
                assert!(attrs.contains_key("triggers"));
                assert!(optional.contains("triggers"));
                assert!(optional.contains("id"));
            }
            other => panic!("expected object type, got {:?}", other),
        }
    }
}
