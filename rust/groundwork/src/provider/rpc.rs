//! Subprocess RPC client for the v1 provider protocol.
//!
//! Launches the provider, validates its handshake line, then exchanges
//! JSON-lines messages over the child's stdio. A reader task routes
//! responses to per-request oneshot channels, so requests may be issued
//! concurrently and answered out of order. The child is killed on drop.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use groundwork_core::diag::Diagnostic;
use groundwork_core::types::Type;
use groundwork_core::value::{Marks, Value};
use groundwork_provider::schema::{self, v1};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-call timeout. None means wait until the provider answers, is
    /// stopped, or dies.
    pub call_timeout: Option<Duration>,
    /// Engine version reported in ConfigureProvider.
    pub engine_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            call_timeout: None,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

type Pending = Arc<Mutex<HashMap<v1::RequestId, oneshot::Sender<v1::ResponsePayload>>>>;

pub struct RpcProvider {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    ids: AtomicU64,
    options: ClientOptions,
    /// Fetched once after launch; used to shape response values.
    schema: tokio::sync::OnceCell<v1::ProviderSchema>,
    /// Serializes calls when the provider declares itself non-reentrant.
    serialize_calls: tokio::sync::OnceCell<bool>,
    call_gate: Mutex<()>,
}

impl RpcProvider {
    pub async fn launch(spec: &super::ProviderSpec, options: ClientOptions) -> Result<RpcProvider> {
        let mut child = Command::new(&spec.executable)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("could not spawn provider process {}", spec.executable))?;

        let stdin = child.stdin.take().context("provider stdin unavailable")?;
        let stdout = child.stdout.take().context("provider stdout unavailable")?;
        let mut reader = BufReader::new(stdout);

        // The first line is the handshake.
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .context("reading provider handshake")?;
        if n == 0 {
            bail!("provider exited before completing its handshake");
        }
        let handshake = schema::parse_handshake(&line)?;
        schema::validate_handshake(&handshake)?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let pending_for_reader = pending.clone();
        tokio::spawn(async move {
            let mut lines = reader.lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match v1::response_from_json(&line) {
                            Ok(response) => {
                                let sender =
                                    pending_for_reader.lock().await.remove(&response.id);
                                match sender {
                                    Some(tx) => {
                                        let _ = tx.send(response.payload);
                                    }
                                    None => {
                                        tracing::warn!(
                                            id = response.id,
                                            "response for unknown request id"
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("undecodable provider response: {:#}", e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("provider stdout read failed: {}", e);
                        break;
                    }
                }
            }
            // Wake every waiter; the channel closing reports the death.
            pending_for_reader.lock().await.clear();
        });

        Ok(RpcProvider {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            ids: AtomicU64::new(0),
            options,
            schema: tokio::sync::OnceCell::new(),
            serialize_calls: tokio::sync::OnceCell::new(),
            call_gate: Mutex::new(()),
        })
    }

    async fn call(&self, payload: v1::RequestPayload) -> Result<v1::ResponsePayload> {
        let serialize = *self.serialize_calls.get().unwrap_or(&false);
        let _gate = if serialize {
            Some(self.call_gate.lock().await)
        } else {
            None
        };

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = v1::Request { id, payload };
        let line = v1::request_to_json(&request)?;
        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .context("writing provider request")?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }

        let response = match self.options.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(r) => r,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    bail!("provider call timed out after {:?}", timeout);
                }
            },
            None => rx.await,
        };
        match response {
            Ok(v1::ResponsePayload::Error { message }) => bail!("provider error: {}", message),
            Ok(payload) => Ok(payload),
            Err(_) => bail!("provider exited without answering"),
        }
    }

    async fn cached_schema(&self) -> Result<&v1::ProviderSchema> {
        self.schema
            .get_or_try_init(|| async {
                match self.call(v1::RequestPayload::GetSchema).await? {
                    v1::ResponsePayload::Schema(s) => {
                        let _ = self.serialize_calls.set(s.server_capabilities.non_reentrant);
                        Ok(s)
                    }
                    other => bail!("unexpected response to GetSchema: {:?}", other),
                }
            })
            .await
    }

    /// The implied object type for a resource or data source, with `any`
    /// as the fallback for unknown types.
    async fn type_for(&self, type_name: &str) -> Result<(Type, Vec<groundwork_core::value::Path>)> {
        let schema = self.cached_schema().await?;
        let block = schema
            .resource_schemas
            .get(type_name)
            .or_else(|| schema.data_schemas.get(type_name))
            .map(|r| &r.block);
        match block {
            Some(block) => Ok((block.implied_type(), block.sensitive_paths())),
            None => Ok((Type::Any, Vec::new())),
        }
    }

    /// Decodes a wire value and re-applies schema-declared sensitivity.
    fn decode(
        wire: &v1::WireValue,
        ty: &Type,
        schema_sensitive: &[groundwork_core::value::Path],
    ) -> Value {
        let mut value = wire.to_value(ty);
        for path in schema_sensitive {
            value.mark_at(path, Marks::sensitive());
        }
        value
    }
}

#[async_trait]
impl super::ProviderOps for RpcProvider {
    async fn schema(&self) -> Result<v1::ProviderSchema> {
        Ok(self.cached_schema().await?.clone())
    }

    async fn validate_provider_config(&self, config: &Value) -> Result<Vec<Diagnostic>> {
        let payload = v1::RequestPayload::ValidateProviderConfig {
            config: v1::WireValue::from_value(config),
        };
        match self.call(payload).await? {
            v1::ResponsePayload::Validated { diagnostics } => Ok(diagnostics),
            other => bail!("unexpected response to ValidateProviderConfig: {:?}", other),
        }
    }

    async fn configure(&self, config: &Value) -> Result<()> {
        let payload = v1::RequestPayload::ConfigureProvider {
            config: v1::WireValue::from_value(config),
            engine_version: self.options.engine_version.clone(),
        };
        match self.call(payload).await? {
            v1::ResponsePayload::Configured => Ok(()),
            other => bail!("unexpected response to ConfigureProvider: {:?}", other),
        }
    }

    async fn validate_resource_config(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<Vec<Diagnostic>> {
        let payload = v1::RequestPayload::ValidateResourceConfig {
            type_name: type_name.to_string(),
            config: v1::WireValue::from_value(config),
        };
        match self.call(payload).await? {
            v1::ResponsePayload::Validated { diagnostics } => Ok(diagnostics),
            other => bail!("unexpected response to ValidateResourceConfig: {:?}", other),
        }
    }

    async fn upgrade_resource_state(
        &self,
        type_name: &str,
        raw_state: &serde_json::Value,
        schema_version: u64,
    ) -> Result<Value> {
        let payload = v1::RequestPayload::UpgradeResourceState {
            type_name: type_name.to_string(),
            raw_state: raw_state.clone(),
            schema_version,
        };
        let (ty, sensitive) = self.type_for(type_name).await?;
        match self.call(payload).await? {
            v1::ResponsePayload::UpgradedState { state } => {
                Ok(Self::decode(&state, &ty, &sensitive))
            }
            other => bail!("unexpected response to UpgradeResourceState: {:?}", other),
        }
    }

    async fn read_resource(
        &self,
        type_name: &str,
        current_state: &Value,
        private: Option<&str>,
    ) -> Result<super::ReadResponse> {
        let payload = v1::RequestPayload::ReadResource {
            type_name: type_name.to_string(),
            current_state: v1::WireValue::from_value(current_state),
            private: private.map(String::from),
        };
        let (ty, sensitive) = self.type_for(type_name).await?;
        match self.call(payload).await? {
            v1::ResponsePayload::ReadResult {
                new_state,
                private,
                deferred,
            } => Ok(super::ReadResponse {
                new_state: new_state
                    .filter(|s| !s.is_null())
                    .map(|s| Self::decode(&s, &ty, &sensitive)),
                private,
                deferred,
            }),
            other => bail!("unexpected response to ReadResource: {:?}", other),
        }
    }

    async fn plan_resource_change(
        &self,
        type_name: &str,
        config: &Value,
        prior_state: &Value,
        proposed_new_state: &Value,
    ) -> Result<super::PlannedChangeResponse> {
        let payload = v1::RequestPayload::PlanResourceChange {
            type_name: type_name.to_string(),
            config: v1::WireValue::from_value(config),
            prior_state: v1::WireValue::from_value(prior_state),
            proposed_new_state: v1::WireValue::from_value(proposed_new_state),
        };
        let (ty, sensitive) = self.type_for(type_name).await?;
        match self.call(payload).await? {
            v1::ResponsePayload::PlannedChange {
                planned_state,
                requires_replace,
                private,
                deferred,
            } => Ok(super::PlannedChangeResponse {
                planned_state: Self::decode(&planned_state, &ty, &sensitive),
                requires_replace,
                private,
                deferred,
            }),
            other => bail!("unexpected response to PlanResourceChange: {:?}", other),
        }
    }

    async fn apply_resource_change(
        &self,
        type_name: &str,
        config: &Value,
        prior_state: &Value,
        planned_state: &Value,
        private: Option<&str>,
    ) -> Result<(Value, Option<String>)> {
        let payload = v1::RequestPayload::ApplyResourceChange {
            type_name: type_name.to_string(),
            config: v1::WireValue::from_value(config),
            prior_state: v1::WireValue::from_value(prior_state),
            planned_state: v1::WireValue::from_value(planned_state),
            private: private.map(String::from),
        };
        let (ty, sensitive) = self.type_for(type_name).await?;
        match self.call(payload).await? {
            v1::ResponsePayload::AppliedChange { new_state, private } => {
                Ok((Self::decode(&new_state, &ty, &sensitive), private))
            }
            other => bail!("unexpected response to ApplyResourceChange: {:?}", other),
        }
    }

    async fn stop(&self) -> Result<()> {
        // Stop is advisory; don't wait long for a response, and always
        // terminate the child afterwards.
        let stop = async {
            let _ = self.call(v1::RequestPayload::Stop).await;
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), stop).await;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            _ => {
                child.kill().await.context("killing provider process")?;
                Ok(())
            }
        }
    }
}
