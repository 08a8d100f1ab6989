//! Recorded state: the engine's memory of every resource instance it
//! manages, plus root module outputs.
//!
//! Two states with the same `lineage` and `serial` must be byte-identical
//! after canonical serialization; [`State::to_canonical_json`] sorts
//! resources and relies on sorted maps throughout.

pub mod backend;
pub mod local;
pub mod object;

use std::collections::BTreeMap;

use groundwork_core::addr::InstanceAddr;
use groundwork_core::types::Type;
use groundwork_core::value::{Path, Value};
use serde::{Deserialize, Serialize};

use crate::encryption::{ArtifactKind, EncryptionHook};
use backend::StateError;

pub const STATE_FORMAT_VERSION: &str = "1.0";

/// A root module output recorded in state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputState {
    pub value: serde_json::Value,
    pub r#type: Type,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
}

/// One resource instance. Identity is (address, deposed key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstanceState {
    pub address: InstanceAddr,
    /// Opaque nonce for an orphaned predecessor pending destruction after
    /// create-before-destroy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    pub schema_version: u64,
    /// Attribute object in wire JSON form.
    pub attributes: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive_paths: Vec<Path>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tainted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub create_before_destroy: bool,
    pub provider: String,
}

impl ResourceInstanceState {
    /// The recorded attributes as a marked value, shaped by `ty`.
    pub fn value(&self, ty: &Type) -> Value {
        Value::from_wire(&self.attributes, ty, &[], &self.sensitive_paths)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub format_version: String,
    pub serial: u64,
    /// Invariant across the life of a workspace; a mismatch on write means
    /// an accidental cross-state overwrite.
    pub lineage: String,
    pub outputs: BTreeMap<String, OutputState>,
    pub resources: Vec<ResourceInstanceState>,
}

impl State {
    pub fn new() -> State {
        State {
            format_version: STATE_FORMAT_VERSION.to_string(),
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            outputs: BTreeMap::new(),
            resources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.outputs.is_empty()
    }

    pub fn get(&self, address: &InstanceAddr, deposed: Option<&str>) -> Option<&ResourceInstanceState> {
        self.resources
            .iter()
            .find(|r| &r.address == address && r.deposed.as_deref() == deposed)
    }

    pub fn put(&mut self, instance: ResourceInstanceState) {
        let addr = instance.address.clone();
        let deposed = instance.deposed.clone();
        self.remove(&addr, deposed.as_deref());
        self.resources.push(instance);
        self.normalize();
    }

    pub fn remove(&mut self, address: &InstanceAddr, deposed: Option<&str>) -> Option<ResourceInstanceState> {
        let idx = self
            .resources
            .iter()
            .position(|r| &r.address == address && r.deposed.as_deref() == deposed)?;
        Some(self.resources.remove(idx))
    }

    /// Moves the current instance at `address` aside under a fresh deposed
    /// key, returning the key.
    pub fn depose(&mut self, address: &InstanceAddr) -> Option<String> {
        let mut current = self.remove(address, None)?;
        let key = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        current.deposed = Some(key.clone());
        self.put(current);
        Some(key)
    }

    /// All deposed instances of `address`.
    pub fn deposed_of(&self, address: &InstanceAddr) -> Vec<&ResourceInstanceState> {
        self.resources
            .iter()
            .filter(|r| &r.address == address && r.deposed.is_some())
            .collect()
    }

    fn normalize(&mut self) {
        self.resources
            .sort_by(|a, b| (&a.address, &a.deposed).cmp(&(&b.address, &b.deposed)));
    }

    /// External JSON rendering: the values representation with outputs and
    /// the module tree of resources.
    pub fn to_external_json(&self, engine_version: &str) -> serde_json::Value {
        use groundwork_core::addr::ResourceMode;

        let mut root_resources = Vec::new();
        let mut child_modules: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
        for r in &self.resources {
            let value = r.value(&Type::Any);
            let mut entry = serde_json::json!({
                "address": r.address.to_string(),
                "mode": match r.address.resource.mode {
                    ResourceMode::Managed => "managed",
                    ResourceMode::Data => "data",
                },
                "type": r.address.resource.r#type,
                "name": r.address.resource.name,
                "provider_name": r.provider,
                "schema_version": r.schema_version,
                "values": r.attributes,
                "sensitive_values": value.mark_structure(&|v| v.marks.sensitive),
                "tainted": r.tainted,
            });
            if !r.dependencies.is_empty() {
                entry["depends_on"] = serde_json::json!(r.dependencies);
            }
            if let Some(deposed) = &r.deposed {
                entry["deposed_key"] = serde_json::json!(deposed);
            }
            match &r.address.key {
                groundwork_core::addr::InstanceKey::None => {}
                groundwork_core::addr::InstanceKey::Index(i) => {
                    entry["index"] = serde_json::json!(i)
                }
                groundwork_core::addr::InstanceKey::Key(k) => {
                    entry["index"] = serde_json::json!(k)
                }
            }
            if r.address.resource.module.is_root() {
                root_resources.push(entry);
            } else {
                child_modules
                    .entry(r.address.resource.module.to_string())
                    .or_default()
                    .push(entry);
            }
        }

        let child_modules: Vec<serde_json::Value> = child_modules
            .into_iter()
            .map(|(address, resources)| {
                serde_json::json!({ "address": address, "resources": resources })
            })
            .collect();

        let outputs: serde_json::Map<String, serde_json::Value> = self
            .outputs
            .iter()
            .map(|(name, o)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "value": o.value,
                        "type": o.r#type.to_json(),
                        "sensitive": o.sensitive,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "format_version": self.format_version,
            "engine_version": engine_version,
            "values": {
                "outputs": outputs,
                "root_module": {
                    "resources": root_resources,
                    "child_modules": child_modules,
                },
            },
            "checks": [],
        })
    }

    /// Canonical serialization: stable field order, resources sorted by
    /// (address, deposed key).
    pub fn to_canonical_json(&self) -> Result<Vec<u8>, StateError> {
        let mut sorted = self.clone();
        sorted.normalize();
        let mut out = serde_json::to_vec_pretty(&sorted)
            .map_err(|e| StateError::Corrupt(e.to_string()))?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn from_json(bytes: &[u8]) -> Result<State, StateError> {
        let state: State =
            serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt(e.to_string()))?;
        let (major, _minor) = parse_format_version(&state.format_version)?;
        let (want_major, _) = parse_format_version(STATE_FORMAT_VERSION)?;
        if major != want_major {
            return Err(StateError::Corrupt(format!(
                "unsupported state format version {:?}",
                state.format_version
            )));
        }
        Ok(state)
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}

pub(crate) fn parse_format_version(v: &str) -> Result<(u64, u64), StateError> {
    let invalid = || StateError::Corrupt(format!("invalid format version {:?}", v));
    let (major, minor) = v.split_once('.').ok_or_else(invalid)?;
    Ok((
        major.parse().map_err(|_| invalid())?,
        minor.parse().map_err(|_| invalid())?,
    ))
}

/// Serializes and encrypts a state snapshot for persistence.
pub fn encode_state(state: &State, hook: &dyn EncryptionHook) -> Result<Vec<u8>, StateError> {
    let plain = state.to_canonical_json()?;
    hook.encrypt(&plain, ArtifactKind::State)
        .map_err(|e| StateError::Backend(e.to_string()))
}

/// Decrypts and parses a persisted state payload.
pub fn decode_state(bytes: &[u8], hook: &dyn EncryptionHook) -> Result<State, StateError> {
    let plain = hook
        .decrypt(bytes, ArtifactKind::State)
        .map_err(|e| StateError::Backend(e.to_string()))?;
    State::from_json(&plain)
}

/// Rejects writes that would regress a peer's serial or cross lineages.
///
/// `based_on_serial` is the serial of the persisted snapshot this write
/// derives from (None for a workspace the writer saw as empty). If the
/// persisted copy has moved past that, a peer wrote concurrently and this
/// write would clobber it.
pub fn check_can_supersede(
    persisted: Option<&State>,
    writing: &State,
    based_on_serial: Option<u64>,
) -> Result<(), StateError> {
    let persisted = match persisted {
        Some(p) => p,
        None => return Ok(()),
    };
    if persisted.lineage != writing.lineage {
        return Err(StateError::LineageMismatch {
            expected: writing.lineage.clone(),
            actual: persisted.lineage.clone(),
        });
    }
    let base = based_on_serial.unwrap_or(0);
    if persisted.serial > base {
        return Err(StateError::SerialRegression {
            persisted: persisted.serial,
            writing: base,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::Disabled;
    use groundwork_core::addr::{InstanceKey, ModulePath, ResourceAddr};

    pub(crate) fn sample_instance(name: &str) -> ResourceInstanceState {
        ResourceInstanceState {
            address: ResourceAddr::managed(ModulePath::root(), "null", name)
                .instance(InstanceKey::None),
            deposed: None,
            schema_version: 1,
            attributes: serde_json::json!({"id": format!("{}-1", name), "triggers": {"x": "1"}}),
            sensitive_paths: Vec::new(),
            private: None,
            dependencies: Vec::new(),
            tainted: false,
            create_before_destroy: false,
            provider: "null".to_string(),
        }
    }

    #[test]
    fn round_trip_preserves_serial_and_lineage() {
        let mut state = State::new();
        state.serial = 7;
        state.put(sample_instance("a"));
        state.outputs.insert(
            "addr".to_string(),
            OutputState {
                value: serde_json::json!("10.0.0.1"),
                r#type: Type::String,
                sensitive: false,
            },
        );

        let bytes = encode_state(&state, &Disabled).unwrap();
        let back = decode_state(&bytes, &Disabled).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.serial, 7);
        assert_eq!(back.lineage, state.lineage);
    }

    #[test]
    fn canonical_serialization_is_stable() {
        let mut a = State::new();
        a.put(sample_instance("b"));
        a.put(sample_instance("a"));

        let mut b = State {
            lineage: a.lineage.clone(),
            ..State::new()
        };
        b.put(sample_instance("a"));
        b.put(sample_instance("b"));

        assert_eq!(
            a.to_canonical_json().unwrap(),
            b.to_canonical_json().unwrap()
        );
    }

    #[test]
    fn depose_moves_instance_aside() {
        let mut state = State::new();
        state.put(sample_instance("a"));
        let addr = sample_instance("a").address;
        let key = state.depose(&addr).unwrap();
        assert!(state.get(&addr, None).is_none());
        assert_eq!(state.deposed_of(&addr).len(), 1);
        assert!(state.get(&addr, Some(&key)).is_some());
    }

    #[test]
    fn supersede_checks() {
        let mut persisted = State::new();
        persisted.serial = 5;
        let writing = persisted.clone();

        // A writer whose snapshot was based on the persisted serial wins.
        assert!(check_can_supersede(Some(&persisted), &writing, Some(5)).is_ok());
        // Nothing persisted yet: any write is fine.
        assert!(check_can_supersede(None, &writing, None).is_ok());

        // A stale base means a peer persisted in between.
        assert!(matches!(
            check_can_supersede(Some(&persisted), &writing, Some(4)),
            Err(StateError::SerialRegression {
                persisted: 5,
                writing: 4
            })
        ));
        // A writer that saw an empty workspace loses to any persisted copy.
        assert!(matches!(
            check_can_supersede(Some(&persisted), &writing, None),
            Err(StateError::SerialRegression { .. })
        ));

        let other_lineage = State::new();
        assert!(matches!(
            check_can_supersede(Some(&persisted), &other_lineage, Some(5)),
            Err(StateError::LineageMismatch { .. })
        ));
    }

    #[test]
    fn rejects_future_major_format() {
        let mut state = State::new();
        state.format_version = "2.0".to_string();
        let bytes = serde_json::to_vec(&state).unwrap();
        assert!(matches!(
            State::from_json(&bytes),
            Err(StateError::Corrupt(_))
        ));

        // Minor bumps are tolerated.
        state.format_version = "1.9".to_string();
        let bytes = serde_json::to_vec(&state).unwrap();
        assert!(State::from_json(&bytes).is_ok());
    }
}
