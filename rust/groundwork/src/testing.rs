//! Shared test doubles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use groundwork_core::diag::Diagnostic;
use groundwork_core::types::Type;
use groundwork_core::value::{Path, Value, ValueKind};
use groundwork_provider::schema::v1::{
    AttributeSchema, BlockSchema, ProviderSchema, ResourceSchema,
};

use crate::provider::{PlannedChangeResponse, ProviderOps, ReadResponse};

/// What ReadResource reports for refreshes.
#[derive(Debug, Clone)]
pub enum ReadBehavior {
    /// The live object matches recorded state.
    Echo,
    /// The live object has drifted to this value.
    Drifted(Value),
    /// The object no longer exists.
    Gone,
}

/// An in-process provider implementing a `null` resource: `triggers`
/// (requires-replace map), optional `password`, computed `id`.
pub struct MockProvider {
    pub read_behavior: Mutex<ReadBehavior>,
    pub apply_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
    counter: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> MockProvider {
        MockProvider {
            read_behavior: Mutex::new(ReadBehavior::Echo),
            apply_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn set_read_behavior(&self, behavior: ReadBehavior) {
        *self.read_behavior.lock().unwrap() = behavior;
    }

    fn null_schema() -> BlockSchema {
        BlockSchema {
            attributes: [
                (
                    "triggers".to_string(),
                    AttributeSchema::optional(Type::Map(Box::new(Type::String))),
                ),
                (
                    "password".to_string(),
                    AttributeSchema {
                        sensitive: true,
                        ..AttributeSchema::optional(Type::String)
                    },
                ),
                ("id".to_string(), AttributeSchema::computed(Type::String)),
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[async_trait]
impl ProviderOps for MockProvider {
    async fn schema(&self) -> Result<ProviderSchema> {
        let mut schema = ProviderSchema::default();
        schema.resource_schemas.insert(
            "null".to_string(),
            ResourceSchema {
                block: Self::null_schema(),
                version: 1,
            },
        );
        schema.data_schemas.insert(
            "null_data".to_string(),
            ResourceSchema {
                block: Self::null_schema(),
                version: 1,
            },
        );
        Ok(schema)
    }

    async fn validate_provider_config(&self, _config: &Value) -> Result<Vec<Diagnostic>> {
        Ok(Vec::new())
    }

    async fn configure(&self, _config: &Value) -> Result<()> {
        Ok(())
    }

    async fn validate_resource_config(
        &self,
        _type_name: &str,
        _config: &Value,
    ) -> Result<Vec<Diagnostic>> {
        Ok(Vec::new())
    }

    async fn upgrade_resource_state(
        &self,
        _type_name: &str,
        raw_state: &serde_json::Value,
        _schema_version: u64,
    ) -> Result<Value> {
        Ok(Value::from_json_typed(
            raw_state,
            &Self::null_schema().implied_type(),
        ))
    }

    async fn read_resource(
        &self,
        _type_name: &str,
        current_state: &Value,
        _private: Option<&str>,
    ) -> Result<ReadResponse> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let new_state = match &*self.read_behavior.lock().unwrap() {
            ReadBehavior::Echo => Some(current_state.clone()),
            ReadBehavior::Drifted(v) => Some(v.clone()),
            ReadBehavior::Gone => None,
        };
        Ok(ReadResponse {
            new_state,
            private: None,
            deferred: None,
        })
    }

    async fn plan_resource_change(
        &self,
        _type_name: &str,
        _config: &Value,
        prior_state: &Value,
        proposed_new_state: &Value,
    ) -> Result<PlannedChangeResponse> {
        let mut planned = proposed_new_state.clone();
        let mut requires_replace = Vec::new();

        if !prior_state.is_null() {
            let triggers = Path::attr("triggers");
            let prior_triggers = prior_state.value_at(&triggers).map(|v| v.without_marks());
            let new_triggers = planned.value_at(&triggers).map(|v| v.without_marks());
            if prior_triggers != new_triggers {
                requires_replace.push(triggers);
                // The replacement gets a fresh id.
                planned.set_at(&Path::attr("id"), Value::unknown(Type::String));
            }
        }

        Ok(PlannedChangeResponse {
            planned_state: planned,
            requires_replace,
            private: None,
            deferred: None,
        })
    }

    async fn apply_resource_change(
        &self,
        _type_name: &str,
        _config: &Value,
        _prior_state: &Value,
        planned_state: &Value,
        _private: Option<&str>,
    ) -> Result<(Value, Option<String>)> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let mut new_state = planned_state.clone();
        if planned_state.is_null() {
            // Destroy.
            return Ok((Value::null(), None));
        }
        for path in planned_state.unknown_paths() {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            new_state.set_at(&path, Value::string(format!("null-{}", n)));
        }
        Ok((new_state, None))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the `triggers` map value used throughout the tests.
pub fn triggers(entries: &[(&str, &str)]) -> Value {
    Value::map(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Value::string(*v)))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// The `id` attribute of an object value, when concrete.
pub fn id_of(value: &Value) -> Option<String> {
    match &value.value_at(&Path::attr("id"))?.kind {
        ValueKind::String(s) => Some(s.clone()),
        _ => None,
    }
}
