//! Engine-side provider access.
//!
//! [`ProviderOps`] is the seam the plan and apply engines call through; the
//! subprocess RPC client in [`rpc`] implements it, and tests substitute
//! in-process fakes. [`ProviderPool`] shares one running provider per
//! provider configuration and guarantees teardown on every exit path.

pub mod rpc;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use groundwork_core::diag::Diagnostic;
use groundwork_core::value::{Path, Value};
use groundwork_provider::schema::v1::{Deferred, ProviderSchema};
use tokio::sync::Mutex;

/// How to launch a provider plugin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderSpec {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The provider's answer to PlanResourceChange.
#[derive(Debug, Clone)]
pub struct PlannedChangeResponse {
    pub planned_state: Value,
    pub requires_replace: Vec<Path>,
    pub private: Option<String>,
    pub deferred: Option<Deferred>,
}

/// The provider's answer to ReadResource.
#[derive(Debug, Clone)]
pub struct ReadResponse {
    /// None when the remote object no longer exists.
    pub new_state: Option<Value>,
    pub private: Option<String>,
    pub deferred: Option<Deferred>,
}

/// Typed operations on one provider instance.
#[async_trait]
pub trait ProviderOps: Send + Sync {
    async fn schema(&self) -> Result<ProviderSchema>;

    async fn validate_provider_config(&self, config: &Value) -> Result<Vec<Diagnostic>>;

    async fn configure(&self, config: &Value) -> Result<()>;

    async fn validate_resource_config(
        &self,
        type_name: &str,
        config: &Value,
    ) -> Result<Vec<Diagnostic>>;

    async fn upgrade_resource_state(
        &self,
        type_name: &str,
        raw_state: &serde_json::Value,
        schema_version: u64,
    ) -> Result<Value>;

    async fn read_resource(
        &self,
        type_name: &str,
        current_state: &Value,
        private: Option<&str>,
    ) -> Result<ReadResponse>;

    async fn plan_resource_change(
        &self,
        type_name: &str,
        config: &Value,
        prior_state: &Value,
        proposed_new_state: &Value,
    ) -> Result<PlannedChangeResponse>;

    async fn apply_resource_change(
        &self,
        type_name: &str,
        config: &Value,
        prior_state: &Value,
        planned_state: &Value,
        private: Option<&str>,
    ) -> Result<(Value, Option<String>)>;

    /// Best-effort cancellation of in-flight work.
    async fn stop(&self) -> Result<()>;
}

/// Shares one running provider per provider configuration.
///
/// Clients are launched lazily on first use and shut down together when the
/// pool is closed; `kill_on_drop` on the child process covers panic and
/// cancellation paths.
pub struct ProviderPool {
    specs: HashMap<String, ProviderSpec>,
    options: rpc::ClientOptions,
    running: Mutex<HashMap<String, Arc<dyn ProviderOps>>>,
}

impl ProviderPool {
    pub fn new(specs: HashMap<String, ProviderSpec>, options: rpc::ClientOptions) -> ProviderPool {
        ProviderPool {
            specs,
            options,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// The provider for `name`, launching and configuring it on first use.
    pub async fn get(&self, name: &str, config: &Value) -> Result<Arc<dyn ProviderOps>> {
        let mut running = self.running.lock().await;
        if let Some(client) = running.get(name) {
            return Ok(client.clone());
        }
        let spec = self
            .specs
            .get(name)
            .with_context(|| format!("no provider is configured under the name {:?}", name))?;
        tracing::info!(provider = name, executable = %spec.executable, "starting provider");
        let client = rpc::RpcProvider::launch(spec, self.options.clone())
            .await
            .with_context(|| format!("could not start provider {:?}", name))?;

        let diagnostics = client
            .validate_provider_config(config)
            .await
            .with_context(|| format!("validating configuration of provider {:?}", name))?;
        if let Some(error) = diagnostics
            .iter()
            .find(|d| d.severity == groundwork_core::diag::Severity::Error)
        {
            anyhow::bail!("provider {:?} rejected its configuration: {}", name, error);
        }
        client
            .configure(config)
            .await
            .with_context(|| format!("configuring provider {:?}", name))?;

        let client: Arc<dyn ProviderOps> = Arc::new(client);
        running.insert(name.to_string(), client.clone());
        Ok(client)
    }

    /// Inserts an already-running provider, for tests and embedders.
    pub async fn insert(&self, name: impl Into<String>, client: Arc<dyn ProviderOps>) {
        self.running.lock().await.insert(name.into(), client);
    }

    /// Asks every running provider to stop. Best effort.
    pub async fn stop_all(&self) {
        let running = self.running.lock().await;
        for (name, client) in running.iter() {
            if let Err(e) = client.stop().await {
                tracing::warn!(provider = name.as_str(), "stop failed: {:#}", e);
            }
        }
    }

    /// Shuts every provider down and clears the pool.
    pub async fn close(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let mut errors = Vec::new();
        for (name, client) in running.drain() {
            if let Err(e) = client.stop().await {
                errors.push(format!("{}: {:#}", name, e));
            }
        }
        if !errors.is_empty() {
            anyhow::bail!("failed to close {} provider(s):\n{}", errors.len(), errors.join("\n"));
        }
        Ok(())
    }
}
