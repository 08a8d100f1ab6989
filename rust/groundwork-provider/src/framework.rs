//! Provider-side scaffolding: implement [`ProviderHandler`] and hand it to
//! [`run_main`] from your provider's `main`.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use groundwork_core::diag::Diagnostic;
use serde_json::Value as Json;

use crate::schema::{self, v1};

/// The result of planning one resource change on the provider side.
#[derive(Debug, Clone, Default)]
pub struct PlannedChange {
    pub planned_state: v1::WireValue,
    pub requires_replace: Vec<groundwork_core::value::Path>,
    pub private: Option<String>,
    pub deferred: Option<v1::Deferred>,
}

/// The operations a resource provider implements.
///
/// Default implementations cover the operations most providers do not need:
/// validation accepts everything and state upgrades are the identity.
pub trait ProviderHandler {
    fn schema(&self) -> v1::ProviderSchema;

    fn validate_provider_config(&self, config: &v1::WireValue) -> Result<Vec<Diagnostic>> {
        let _ = config;
        Ok(Vec::new())
    }

    fn configure(&mut self, config: &v1::WireValue, engine_version: &str) -> Result<()> {
        let _ = (config, engine_version);
        Ok(())
    }

    fn validate_resource_config(
        &self,
        type_name: &str,
        config: &v1::WireValue,
    ) -> Result<Vec<Diagnostic>> {
        let _ = (type_name, config);
        Ok(Vec::new())
    }

    fn upgrade_resource_state(
        &self,
        type_name: &str,
        raw_state: &Json,
        schema_version: u64,
    ) -> Result<v1::WireValue> {
        let _ = (type_name, schema_version);
        Ok(v1::WireValue {
            json: raw_state.clone(),
            unknown: Vec::new(),
            sensitive: Vec::new(),
        })
    }

    /// Observe the live object. Returning None reports it as gone.
    fn read(&self, type_name: &str, current_state: &v1::WireValue)
        -> Result<Option<v1::WireValue>>;

    fn plan(
        &self,
        type_name: &str,
        config: &v1::WireValue,
        prior_state: &v1::WireValue,
        proposed_new_state: &v1::WireValue,
    ) -> Result<PlannedChange>;

    fn apply(
        &self,
        type_name: &str,
        config: &v1::WireValue,
        prior_state: &v1::WireValue,
        planned_state: &v1::WireValue,
    ) -> Result<v1::WireValue>;
}

fn dispatch(handler: &mut impl ProviderHandler, payload: v1::RequestPayload) -> v1::ResponsePayload {
    let result: Result<v1::ResponsePayload> = (|| match payload {
        v1::RequestPayload::GetSchema => {
            let _span = tracing::info_span!("get_schema").entered();
            Ok(v1::ResponsePayload::Schema(handler.schema()))
        }
        v1::RequestPayload::ValidateProviderConfig { config } => {
            let diagnostics = handler.validate_provider_config(&config)?;
            Ok(v1::ResponsePayload::Validated { diagnostics })
        }
        v1::RequestPayload::ConfigureProvider {
            config,
            engine_version,
        } => {
            let _span = tracing::info_span!("configure").entered();
            handler.configure(&config, &engine_version)?;
            Ok(v1::ResponsePayload::Configured)
        }
        v1::RequestPayload::ValidateResourceConfig { type_name, config } => {
            let diagnostics = handler.validate_resource_config(&type_name, &config)?;
            Ok(v1::ResponsePayload::Validated { diagnostics })
        }
        v1::RequestPayload::UpgradeResourceState {
            type_name,
            raw_state,
            schema_version,
        } => {
            let state = handler.upgrade_resource_state(&type_name, &raw_state, schema_version)?;
            Ok(v1::ResponsePayload::UpgradedState { state })
        }
        v1::RequestPayload::ReadResource {
            type_name,
            current_state,
            private,
        } => {
            let _span = tracing::info_span!("read", r#type = type_name.as_str()).entered();
            let new_state = handler
                .read(&type_name, &current_state)
                .with_context(|| format!("could not read {} resource", type_name))?;
            Ok(v1::ResponsePayload::ReadResult {
                new_state,
                private,
                deferred: None,
            })
        }
        v1::RequestPayload::PlanResourceChange {
            type_name,
            config,
            prior_state,
            proposed_new_state,
        } => {
            let _span = tracing::info_span!("plan", r#type = type_name.as_str()).entered();
            let planned = handler
                .plan(&type_name, &config, &prior_state, &proposed_new_state)
                .with_context(|| format!("could not plan {} resource change", type_name))?;
            Ok(v1::ResponsePayload::PlannedChange {
                planned_state: planned.planned_state,
                requires_replace: planned.requires_replace,
                private: planned.private,
                deferred: planned.deferred,
            })
        }
        v1::RequestPayload::ApplyResourceChange {
            type_name,
            config,
            prior_state,
            planned_state,
            private,
        } => {
            let _span = tracing::info_span!("apply", r#type = type_name.as_str()).entered();
            let new_state = handler
                .apply(&type_name, &config, &prior_state, &planned_state)
                .with_context(|| format!("could not apply {} resource change", type_name))?;
            Ok(v1::ResponsePayload::AppliedChange { new_state, private })
        }
        v1::RequestPayload::Stop => Ok(v1::ResponsePayload::Stopping),
    })();

    result.unwrap_or_else(|e| v1::ResponsePayload::Error {
        message: format!("{:#}", e),
    })
}

/// Serves the protocol on stdin/stdout until Stop or end of input.
///
/// Prints the handshake line first. Any logging the handler does must go to
/// stderr.
pub fn run_main(mut handler: impl ProviderHandler) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "{}", schema::handshake_line())
        .and_then(|_| out.flush())
        .context("writing handshake")
        .unwrap_or_exit();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading request line").unwrap_or_exit();
        if line.trim().is_empty() {
            continue;
        }
        let request = v1::request_from_json(&line)
            .context("parsing request message")
            .unwrap_or_exit();

        let stop = matches!(request.payload, v1::RequestPayload::Stop);
        let response = v1::Response {
            id: request.id,
            payload: dispatch(&mut handler, request.payload),
        };
        let s = v1::response_to_json(&response)
            .context("encoding response")
            .unwrap_or_exit();
        writeln!(out, "{}", s)
            .and_then(|_| out.flush())
            .context("writing response")
            .unwrap_or_exit();

        if stop {
            break;
        }
    }
}

trait ProviderMainError {
    type V;
    fn unwrap_or_exit(self) -> Self::V;
}
impl<T> ProviderMainError for Result<T> {
    type V = T;
    fn unwrap_or_exit(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                eprintln!("provider error: {:?}", e);
                std::process::exit(1);
            }
        }
    }
}
