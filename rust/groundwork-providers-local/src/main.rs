//! The local reference provider.
//!
//! Implements two resource types against the local machine:
//! - `null`: holds a `triggers` map; any change to it forces replacement.
//!   Useful for wiring dependencies and testing the engine.
//! - `file`: a file on disk with `path` and `content`; changing the path
//!   forces replacement, changing the content updates in place.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use groundwork_core::diag::Diagnostic;
use groundwork_core::types::Type;
use groundwork_core::value::{Path, PathStep, Value, ValueKind};
use groundwork_provider::framework::{run_main, PlannedChange, ProviderHandler};
use groundwork_provider::schema::v1::{
    AttributeSchema, BlockSchema, ProviderSchema, ResourceSchema, WireValue,
};

struct LocalProvider;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct FileConfig {
    path: String,
    content: String,
}

fn null_schema() -> ResourceSchema {
    ResourceSchema {
        block: BlockSchema {
            attributes: [
                (
                    "triggers".to_string(),
                    AttributeSchema::optional(Type::Map(Box::new(Type::String))),
                ),
                ("id".to_string(), AttributeSchema::computed(Type::String)),
            ]
            .into_iter()
            .collect(),
        },
        version: 1,
    }
}

fn file_schema() -> ResourceSchema {
    ResourceSchema {
        block: BlockSchema {
            attributes: [
                ("path".to_string(), AttributeSchema::required(Type::String)),
                (
                    "content".to_string(),
                    AttributeSchema::required(Type::String),
                ),
                ("id".to_string(), AttributeSchema::computed(Type::String)),
                (
                    "content_sha256".to_string(),
                    AttributeSchema::computed(Type::String),
                ),
            ]
            .into_iter()
            .collect(),
        },
        version: 1,
    }
}

fn implied_type(type_name: &str) -> Type {
    match type_name {
        "file" => file_schema().block.implied_type(),
        _ => null_schema().block.implied_type(),
    }
}

fn attr(value: &Value, name: &str) -> Option<Value> {
    value.value_at(&Path::attr(name)).cloned()
}

fn set_attr(value: &mut Value, name: &str, new_value: Value) {
    value.set_at(&Path::attr(name), new_value);
}

fn fresh_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos().to_le_bytes())
            .unwrap_or_default(),
    );
    hex::encode(&hasher.finalize()[..8])
}

fn decode_file_config(config: &Value) -> Result<FileConfig> {
    let json = config.to_wire_json();
    serde_json::from_value(json).context("invalid file resource configuration")
}

impl ProviderHandler for LocalProvider {
    fn schema(&self) -> ProviderSchema {
        ProviderSchema {
            provider: BlockSchema::default(),
            resource_schemas: [
                ("null".to_string(), null_schema()),
                ("file".to_string(), file_schema()),
            ]
            .into_iter()
            .collect(),
            data_schemas: BTreeMap::new(),
            server_capabilities: Default::default(),
        }
    }

    fn validate_resource_config(
        &self,
        type_name: &str,
        config: &WireValue,
    ) -> Result<Vec<Diagnostic>> {
        let mut diags = Vec::new();
        if type_name == "file" {
            let value = config.to_value(&implied_type(type_name));
            if let Some(path) = attr(&value, "path") {
                if path.as_str().map(|p| p.is_empty()).unwrap_or(false) {
                    diags.push(Diagnostic::error("file path must not be empty"));
                }
            }
        }
        Ok(diags)
    }

    fn read(&self, type_name: &str, current_state: &WireValue) -> Result<Option<WireValue>> {
        let ty = implied_type(type_name);
        let value = current_state.to_value(&ty);
        match type_name {
            "null" => Ok(Some(current_state.clone())),
            "file" => {
                let config = decode_file_config(&value)?;
                match std::fs::read_to_string(&config.path) {
                    Ok(content) => {
                        let mut observed = value.clone();
                        set_attr(&mut observed, "content", Value::string(content.clone()));
                        set_attr(
                            &mut observed,
                            "content_sha256",
                            Value::string(hex::encode(Sha256::digest(content.as_bytes()))),
                        );
                        Ok(Some(WireValue::from_value(&observed)))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e).with_context(|| format!("reading {}", config.path)),
                }
            }
            other => bail!("unknown resource type {:?}", other),
        }
    }

    fn plan(
        &self,
        type_name: &str,
        _config: &WireValue,
        prior_state: &WireValue,
        proposed_new_state: &WireValue,
    ) -> Result<PlannedChange> {
        let ty = implied_type(type_name);
        let mut planned = proposed_new_state.to_value(&ty);
        let mut requires_replace = Vec::new();

        if !prior_state.is_null() {
            let prior = prior_state.to_value(&ty);
            let force_new = match type_name {
                "file" => vec!["path"],
                _ => vec!["triggers"],
            };
            for name in force_new {
                let p = Path::attr(name);
                let before = prior.value_at(&p).map(|v| v.without_marks());
                let after = planned.value_at(&p).map(|v| v.without_marks());
                if before != after {
                    requires_replace.push(p);
                }
            }
            if !requires_replace.is_empty() {
                set_attr(&mut planned, "id", Value::unknown(Type::String));
            }
        }

        if type_name == "file" {
            // Content hash follows content.
            let content_hash = match planned.value_at(&Path::attr("content")) {
                Some(content) if !content.is_unknown() => {
                    if let ValueKind::String(s) = &content.kind {
                        Some(Value::string(hex::encode(Sha256::digest(s.as_bytes()))))
                    } else {
                        None
                    }
                }
                _ => Some(Value::unknown(Type::String)),
            };
            if let Some(hash) = content_hash {
                set_attr(&mut planned, "content_sha256", hash);
            }
        }

        Ok(PlannedChange {
            planned_state: WireValue::from_value(&planned),
            requires_replace,
            private: None,
            deferred: None,
        })
    }

    fn apply(
        &self,
        type_name: &str,
        _config: &WireValue,
        prior_state: &WireValue,
        planned_state: &WireValue,
    ) -> Result<WireValue> {
        let ty = implied_type(type_name);

        // A null planned state is a destroy.
        if planned_state.is_null() {
            if type_name == "file" && !prior_state.is_null() {
                let prior = prior_state.to_value(&ty);
                let config = decode_file_config(&prior)?;
                match std::fs::remove_file(&config.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("removing {}", config.path)),
                }
            }
            return Ok(WireValue::null());
        }

        let mut new_state = planned_state.to_value(&ty);
        match type_name {
            "null" => {}
            "file" => {
                let config = decode_file_config(&new_state)?;
                if let Some(parent) = std::path::Path::new(&config.path).parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating parent of {}", config.path))?;
                }
                std::fs::write(&config.path, &config.content)
                    .with_context(|| format!("writing {}", config.path))?;
                set_attr(
                    &mut new_state,
                    "content_sha256",
                    Value::string(hex::encode(Sha256::digest(config.content.as_bytes()))),
                );
            }
            other => bail!("unknown resource type {:?}", other),
        }

        // Settle any remaining unknowns (the id on create).
        for path in new_state.unknown_paths() {
            let leaf = path.0.last();
            if matches!(leaf, Some(PathStep::Attr(a)) if a == "id") {
                new_state.set_at(&path, Value::string(format!("{}-{}", type_name, fresh_id())));
            } else {
                new_state.set_at(&path, Value::null());
            }
        }
        if attr(&new_state, "id").map(|v| v.is_null()).unwrap_or(true) {
            set_attr(
                &mut new_state,
                "id",
                Value::string(format!("{}-{}", type_name, fresh_id())),
            );
        }

        Ok(WireValue::from_value(&new_state))
    }
}

fn main() {
    run_main(LocalProvider);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(json: serde_json::Value) -> WireValue {
        WireValue {
            json,
            unknown: Vec::new(),
            sensitive: Vec::new(),
        }
    }

    #[test]
    fn null_resource_replaces_on_trigger_change() {
        let p = LocalProvider;
        let prior = wire(serde_json::json!({
            "triggers": {"x": "1"}, "id": "null-abc"
        }));
        let proposed = wire(serde_json::json!({
            "triggers": {"x": "2"}, "id": "null-abc"
        }));
        let planned = p
            .plan("null", &proposed, &prior, &proposed)
            .unwrap();
        assert_eq!(planned.requires_replace, vec![Path::attr("triggers")]);
        let planned_value = planned
            .planned_state
            .to_value(&implied_type("null"));
        assert!(planned_value
            .value_at(&Path::attr("id"))
            .unwrap()
            .is_unknown());
    }

    #[test]
    fn null_resource_no_change_keeps_state() {
        let p = LocalProvider;
        let prior = wire(serde_json::json!({
            "triggers": {"x": "1"}, "id": "null-abc"
        }));
        let planned = p.plan("null", &prior, &prior, &prior).unwrap();
        assert!(planned.requires_replace.is_empty());
    }

    #[test]
    fn file_create_write_read_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt").display().to_string();
        let p = LocalProvider;

        let planned = wire(serde_json::json!({
            "path": path, "content": "hi", "id": null, "content_sha256": null
        }));
        let applied = p
            .apply("file", &planned, &WireValue::null(), &planned)
            .unwrap();
        let value = applied.to_value(&implied_type("file"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hello.txt")).unwrap(),
            "hi"
        );
        assert!(attr(&value, "id").unwrap().as_str().unwrap().starts_with("file-"));
        assert_eq!(
            attr(&value, "content_sha256").unwrap().as_str().unwrap(),
            hex::encode(Sha256::digest(b"hi"))
        );

        // Read observes the on-disk content.
        std::fs::write(dir.path().join("hello.txt"), "changed").unwrap();
        let observed = p.read("file", &applied).unwrap().unwrap();
        let observed = observed.to_value(&implied_type("file"));
        assert_eq!(attr(&observed, "content").unwrap().as_str(), Some("changed"));

        // Destroy removes the file; a second read reports it gone.
        p.apply("file", &WireValue::null(), &applied, &WireValue::null())
            .unwrap();
        assert!(!dir.path().join("hello.txt").exists());
        assert!(p.read("file", &applied).unwrap().is_none());
    }

    #[test]
    fn file_path_change_forces_replacement() {
        let p = LocalProvider;
        let prior = wire(serde_json::json!({
            "path": "/tmp/a", "content": "x", "id": "file-1", "content_sha256": "aa"
        }));
        let proposed = wire(serde_json::json!({
            "path": "/tmp/b", "content": "x", "id": "file-1", "content_sha256": "aa"
        }));
        let planned = p.plan("file", &proposed, &prior, &proposed).unwrap();
        assert_eq!(planned.requires_replace, vec![Path::attr("path")]);
    }

    #[test]
    fn empty_file_path_is_rejected() {
        let p = LocalProvider;
        let config = wire(serde_json::json!({"path": "", "content": "x"}));
        let diags = p.validate_resource_config("file", &config).unwrap();
        assert_eq!(diags.len(), 1);
    }
}
