//! Command implementations: thin orchestration over the engine modules.
//!
//! Exit codes: 0 success, 1 error, 2 "plan has changes" under
//! `--detailed-exitcode`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use groundwork_core::diag::Diagnostics;
use groundwork_core::value::Value;
use tokio::sync::Mutex;

use crate::apply::{self, ApplyOptions, StatePersister};
use crate::cache::ProviderCache;
use crate::config::{self, variables, Config, Settings};
use crate::deplock::{hash_archive, LockFile, LockMode, LOCK_FILE_NAME};
use crate::encryption::{AeadEncryption, Disabled, EncryptionHook, Passphrase, StaticKey};
use crate::eval::eval_literal;
use crate::interrupt::InterruptState;
use crate::plan::{self, file as planfile, objects::PlanMode, PlanOptions};
use crate::provider::{rpc::ClientOptions, ProviderPool, ProviderSpec};
use crate::state::backend::{
    lock_with_timeout, Backend, LockInfo, StateManager, DEFAULT_WORKSPACE,
};
use crate::state::local::LocalBackend;
use crate::state::object::{FsObjectStore, ObjectBackend};
use crate::state::State;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_CHANGES: i32 = 2;

#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub chdir: Option<PathBuf>,
    pub parallelism: usize,
    pub lock_timeout_secs: u64,
    pub consolidate_warnings: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VarArgs {
    pub vars: Vec<variables::CliArg>,
}

pub struct PlanCommand {
    pub out: Option<PathBuf>,
    pub detailed_exitcode: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub destroy: bool,
    pub json: bool,
    pub targets: Vec<String>,
    pub replace: Vec<String>,
    pub var_args: VarArgs,
}

pub struct ApplyCommand {
    pub plan_file: Option<PathBuf>,
    pub var_args: VarArgs,
}

fn root_dir(options: &GlobalOptions) -> PathBuf {
    options
        .chdir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
}

fn print_diags(diags: &Diagnostics) {
    for d in diags.iter() {
        eprintln!("{}", d);
    }
}

/// Loads configuration, failing with printed diagnostics on errors.
fn load_config(options: &GlobalOptions) -> Result<Option<Config>> {
    let dir = root_dir(options);
    let (config, diags) = config::load_dir(&dir);
    print_diags(&diags);
    if diags.has_errors() {
        return Ok(None);
    }
    Ok(Some(config))
}

fn bind_variables(
    options: &GlobalOptions,
    config: &Config,
    var_args: &VarArgs,
) -> (BTreeMap<String, Value>, Diagnostics) {
    let env: Vec<(String, String)> = std::env::vars().collect();
    variables::resolve(
        &root_dir(options),
        &config.root.variables,
        &var_args.vars,
        &env,
        &variables::Options {
            consolidate_warnings: options.consolidate_warnings,
        },
    )
}

/// The encryption hook configured in the `engine` block, or identity.
/// Key material comes from the environment so it never lands in config
/// files: `GW_ENCRYPTION_PASSPHRASE` or `GW_ENCRYPTION_KEY` (hex).
fn build_encryption(settings: &Settings) -> Result<Arc<dyn EncryptionHook>> {
    let enc = match &settings.encryption {
        Some(enc) => enc,
        None => return Ok(Arc::new(Disabled)),
    };
    match enc.key_provider.as_deref() {
        None | Some("passphrase") => {
            let passphrase = std::env::var("GW_ENCRYPTION_PASSPHRASE")
                .context("state encryption is enabled but GW_ENCRYPTION_PASSPHRASE is not set")?;
            Ok(Arc::new(AeadEncryption::new(Passphrase::new(passphrase))))
        }
        Some("static_key") => {
            let key = std::env::var("GW_ENCRYPTION_KEY")
                .context("state encryption is enabled but GW_ENCRYPTION_KEY is not set")?;
            Ok(Arc::new(AeadEncryption::new(StaticKey::from_hex(&key)?)))
        }
        Some(other) => bail!("unknown encryption key provider {:?}", other),
    }
}

/// Builds the configured backend; the local backend under
/// `.groundwork/state` is the default.
fn build_backend(
    options: &GlobalOptions,
    settings: &Settings,
    encryption: Arc<dyn EncryptionHook>,
) -> Result<Box<dyn Backend>> {
    let dir = root_dir(options);
    let backend_config = settings.backend.clone().unwrap_or_default();
    let literal = |name: &str| -> Option<String> {
        backend_config
            .body
            .get(name)
            .and_then(|e| eval_literal(e).ok())
            .and_then(|v| v.as_str().map(String::from))
    };

    match backend_config.r#type.as_str() {
        "" | "local" => {
            let path = literal("path")
                .map(PathBuf::from)
                .unwrap_or_else(|| dir.join(".groundwork").join("state"));
            Ok(Box::new(LocalBackend::new(path, encryption)))
        }
        "object" => {
            let root = literal("root")
                .context("object backend requires a root argument")?;
            let prefix = literal("prefix").unwrap_or_else(|| "env".to_string());
            Ok(Box::new(ObjectBackend::new(
                Arc::new(FsObjectStore::new(root)),
                prefix,
                encryption,
            )))
        }
        other => bail!("unknown backend type {:?}", other),
    }
}

fn environment_file(options: &GlobalOptions) -> PathBuf {
    root_dir(options).join(".groundwork").join("environment")
}

pub fn current_workspace(options: &GlobalOptions) -> String {
    std::fs::read_to_string(environment_file(options))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string())
}

/// Provider launch specs for every required provider.
///
/// Resolution order: `GW_PROVIDER_<NAME>` (a development override naming an
/// executable), then the plugin cache using the locked version, verified
/// against the dependency lock.
fn provider_specs(
    options: &GlobalOptions,
    config: &Config,
) -> Result<HashMap<String, ProviderSpec>> {
    let lock = LockFile::read(&root_dir(options).join(LOCK_FILE_NAME))?;
    let cache = ProviderCache::default_location();
    let mut specs = HashMap::new();
    for (local_name, requirement) in &config.root.settings.required_providers {
        let env_key = format!("GW_PROVIDER_{}", local_name.to_uppercase());
        if let Ok(executable) = std::env::var(&env_key) {
            specs.insert(
                local_name.clone(),
                ProviderSpec {
                    executable,
                    args: Vec::new(),
                },
            );
            continue;
        }
        let locked = lock.providers.get(&requirement.source).with_context(|| {
            format!(
                "provider {} is not in {}; run `groundwork providers lock`",
                requirement.source, LOCK_FILE_NAME
            )
        })?;
        let path = cache.resolve_verified(&lock, &requirement.source, &locked.version)?;
        specs.insert(
            local_name.clone(),
            ProviderSpec {
                executable: path.display().to_string(),
                args: Vec::new(),
            },
        );
    }
    Ok(specs)
}

fn pool_for(options: &GlobalOptions, config: &Config) -> Result<ProviderPool> {
    let specs = provider_specs(options, config)?;
    Ok(ProviderPool::new(specs, ClientOptions::default()))
}

struct ManagerPersister {
    mgr: Mutex<Box<dyn StateManager>>,
}

#[async_trait]
impl StatePersister for ManagerPersister {
    async fn persist(&self, state: &State) -> Result<()> {
        let mut mgr = self.mgr.lock().await;
        mgr.write_state(state.clone())
            .map_err(anyhow::Error::from)?;
        mgr.persist_state().await.map_err(anyhow::Error::from)
    }
}

async fn locked_state_mgr(
    options: &GlobalOptions,
    backend: &dyn Backend,
    operation: &str,
) -> Result<(Box<dyn StateManager>, String)> {
    let workspace = current_workspace(options);
    let mut mgr = backend.state_mgr(&workspace).await?;
    let info = LockInfo::new(operation);
    let lock_id = lock_with_timeout(
        mgr.as_mut(),
        &info,
        std::time::Duration::from_secs(options.lock_timeout_secs),
    )
    .await?;
    Ok((mgr, lock_id))
}

pub async fn run_plan(
    interrupt: &InterruptState,
    options: &GlobalOptions,
    cmd: PlanCommand,
) -> Result<i32> {
    let config = match load_config(options)? {
        Some(c) => c,
        None => return Ok(EXIT_ERROR),
    };
    let (vars, var_diags) = bind_variables(options, &config, &cmd.var_args);
    print_diags(&var_diags);
    if var_diags.has_errors() {
        return Ok(EXIT_ERROR);
    }

    let encryption = build_encryption(&config.root.settings)?;
    let backend = build_backend(options, &config.root.settings, encryption.clone())?;
    let (mut mgr, lock_id) = locked_state_mgr(options, backend.as_ref(), "plan").await?;
    let prior = mgr.state().unwrap_or_default();

    let pool = pool_for(options, &config)?;
    let mode = match (cmd.destroy, cmd.refresh_only) {
        (true, _) => PlanMode::Destroy,
        (_, true) => PlanMode::RefreshOnly,
        _ => PlanMode::Normal,
    };
    let plan_options = PlanOptions {
        mode,
        refresh: cmd.refresh,
        targets: cmd.targets.clone(),
        replace: cmd.replace.clone(),
        forget: Vec::new(),
    };

    let result = plan::plan(&config, &vars, &prior, &pool, &plan_options, interrupt).await;
    let close = pool.close().await;
    mgr.unlock(&lock_id).await?;
    close?;
    let (plan, diags) = result?;
    print_diags(&diags);

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&plan.to_external_json())?);
    } else {
        summarize_plan(&plan);
    }

    if let Some(out) = &cmd.out {
        let snapshot = planfile::snapshot_config(&root_dir(options))?;
        planfile::write_plan_file(
            out,
            &planfile::PlanFile::new(plan.clone(), snapshot),
            encryption.as_ref(),
        )?;
        tracing::info!(path = %out.display(), "saved plan");
    }

    if plan.errored {
        Ok(EXIT_ERROR)
    } else if cmd.detailed_exitcode && plan.has_changes() {
        Ok(EXIT_CHANGES)
    } else {
        Ok(EXIT_OK)
    }
}

fn summarize_plan(plan: &plan::objects::Plan) {
    let mut add = 0;
    let mut change = 0;
    let mut destroy = 0;
    for c in &plan.resource_changes {
        use plan::objects::Action::*;
        match c.action {
            Create => add += 1,
            Update => change += 1,
            Delete | Forget => destroy += 1,
            CreateThenDelete | DeleteThenCreate => {
                add += 1;
                destroy += 1;
            }
            NoOp | Read => {}
        }
    }
    for c in &plan.resource_changes {
        if !c.action.is_no_op() {
            let reason = c
                .action_reason
                .map(|r| format!(" ({:?})", r))
                .unwrap_or_default();
            eprintln!("  {:?} {}{}", c.action, c.address, reason);
        }
    }
    eprintln!("Plan: {} to add, {} to change, {} to destroy.", add, change, destroy);
}

pub async fn run_apply(
    interrupt: &InterruptState,
    options: &GlobalOptions,
    cmd: ApplyCommand,
) -> Result<i32> {
    let encryption;
    let the_plan;
    let config;

    match &cmd.plan_file {
        Some(path) => {
            // Saved plans carry the configuration they were planned from.
            let probe = planfile::read_plan_file(path, &Disabled)
                .or_else(|_| -> Result<planfile::PlanFile> {
                    // Possibly encrypted; load config first for key settings.
                    let cfg = load_config(options)?
                        .context("cannot load configuration for plan decryption")?;
                    let hook = build_encryption(&cfg.root.settings)?;
                    planfile::read_plan_file(path, hook.as_ref())
                })?;
            let dir = tempfile::tempdir().context("restoring configuration snapshot")?;
            planfile::restore_snapshot(&probe.config_snapshot, dir.path())?;
            let (cfg, diags) = config::load_dir(dir.path());
            print_diags(&diags);
            if diags.has_errors() {
                return Ok(EXIT_ERROR);
            }
            encryption = build_encryption(&cfg.root.settings)?;
            the_plan = probe.plan;
            config = cfg;
        }
        None => {
            let cfg = match load_config(options)? {
                Some(c) => c,
                None => return Ok(EXIT_ERROR),
            };
            let (vars, var_diags) = bind_variables(options, &cfg, &cmd.var_args);
            print_diags(&var_diags);
            if var_diags.has_errors() {
                return Ok(EXIT_ERROR);
            }
            encryption = build_encryption(&cfg.root.settings)?;
            let backend = build_backend(options, &cfg.root.settings, encryption.clone())?;
            let (mut mgr, lock_id) = locked_state_mgr(options, backend.as_ref(), "plan").await?;
            let prior = mgr.state().unwrap_or_default();
            let pool = pool_for(options, &cfg)?;
            let result = plan::plan(
                &cfg,
                &vars,
                &prior,
                &pool,
                &PlanOptions::default(),
                interrupt,
            )
            .await;
            let close = pool.close().await;
            mgr.unlock(&lock_id).await?;
            close?;
            let (p, diags) = result?;
            print_diags(&diags);
            if p.errored {
                return Ok(EXIT_ERROR);
            }
            the_plan = p;
            config = cfg;
        }
    }

    if !the_plan.has_changes() {
        eprintln!("No changes. Infrastructure is up to date.");
        return Ok(EXIT_OK);
    }

    let backend = build_backend(options, &config.root.settings, encryption.clone())?;
    let (mut mgr, lock_id) = locked_state_mgr(options, backend.as_ref(), "apply").await?;
    let mut state = mgr.state().unwrap_or_else(|| the_plan.prior_state.clone());

    let pool = pool_for(options, &config)?;
    let apply_options = ApplyOptions {
        parallelism: options.parallelism,
        persist_every: 1,
    };

    let persister = Arc::new(ManagerPersister {
        mgr: Mutex::new(mgr),
    });
    let report = apply::apply_with_persister(
        &the_plan,
        &mut state,
        &pool,
        &apply_options,
        interrupt,
        persister.clone(),
    )
    .await;
    let close = pool.close().await;
    {
        let mut mgr = persister.mgr.lock().await;
        mgr.unlock(&lock_id).await?;
    }
    close?;
    let report = report?;

    for (node, error) in &report.failed {
        eprintln!("Error applying {}: {}", node, error);
    }
    if report.cancelled {
        eprintln!("Apply cancelled; {} change(s) were not attempted.", report.skipped);
    }
    eprintln!(
        "Apply complete. Resources: {} applied, {} failed, {} skipped.",
        report.applied,
        report.failed.len(),
        report.skipped
    );
    Ok(if report.success() { EXIT_OK } else { EXIT_ERROR })
}

pub async fn run_validate(options: &GlobalOptions) -> Result<i32> {
    match load_config(options)? {
        Some(config) => {
            let graph = crate::graph::config_graph::build(&config);
            match graph.topo_order() {
                Ok(_) => {
                    eprintln!("Success! The configuration is valid.");
                    Ok(EXIT_OK)
                }
                Err(cycle) => {
                    eprintln!("Error: dependency cycle: {}", cycle);
                    Ok(EXIT_ERROR)
                }
            }
        }
        None => Ok(EXIT_ERROR),
    }
}

pub async fn run_providers_lock(
    options: &GlobalOptions,
    upgrade: bool,
    platforms: Vec<String>,
) -> Result<i32> {
    let config = match load_config(options)? {
        Some(c) => c,
        None => return Ok(EXIT_ERROR),
    };
    let lock_path = root_dir(options).join(LOCK_FILE_NAME);
    let mut lock = LockFile::read(&lock_path)?;
    let mode = if upgrade {
        LockMode::Upgrade
    } else {
        LockMode::InstallNewOnly
    };
    let cache = ProviderCache::default_location();

    for (local_name, requirement) in &config.root.settings.required_providers {
        // Without a registry client, the selected version is the locked one
        // or the exact version named in the constraint.
        let version = lock
            .providers
            .get(&requirement.source)
            .map(|l| l.version.clone())
            .or_else(|| requirement.version_constraint.clone())
            .with_context(|| {
                format!(
                    "provider {:?} ({}) has no version constraint and no locked version",
                    local_name, requirement.source
                )
            })?;
        let version = version.trim_start_matches(['=', ' ']).to_string();

        let mut hashes = std::collections::BTreeSet::new();
        if let Some(binary) = cache.resolve(&requirement.source, &version) {
            let bytes = std::fs::read(&binary)?;
            let platform = format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH);
            hashes.insert(hash_archive(&bytes, Some(&platform)));
        }
        lock.record(
            mode,
            &requirement.source,
            &version,
            requirement.version_constraint.as_deref(),
            hashes,
        )?;
    }

    lock.write(&lock_path)?;
    let platform_refs: Vec<&str> = platforms.iter().map(String::as_str).collect();
    if !platform_refs.is_empty() {
        for warning in lock.incomplete_warnings(&platform_refs) {
            eprintln!("Warning: {}", warning);
        }
    }
    eprintln!("Dependency lock file written to {}", lock_path.display());
    Ok(EXIT_OK)
}

/// `show -json`: the current state in the external values representation.
pub async fn run_show(options: &GlobalOptions) -> Result<i32> {
    let config = load_config(options)?.context("cannot load configuration")?;
    let encryption = build_encryption(&config.root.settings)?;
    let backend = build_backend(options, &config.root.settings, encryption)?;
    let workspace = current_workspace(options);
    let mgr = backend.state_mgr(&workspace).await?;
    let state = mgr.state().unwrap_or_default();
    println!(
        "{}",
        serde_json::to_string_pretty(&state.to_external_json(env!("CARGO_PKG_VERSION")))?
    );
    Ok(EXIT_OK)
}

pub async fn run_workspace_list(options: &GlobalOptions) -> Result<i32> {
    let config = load_config(options)?.context("cannot load configuration")?;
    let encryption = build_encryption(&config.root.settings)?;
    let backend = build_backend(options, &config.root.settings, encryption)?;
    let current = current_workspace(options);
    let mut names = backend.workspaces().await?;
    if !names.contains(&current) {
        names.push(current.clone());
        names.sort();
    }
    for name in names {
        if name == current {
            println!("* {}", name);
        } else {
            println!("  {}", name);
        }
    }
    Ok(EXIT_OK)
}

pub async fn run_workspace_select(options: &GlobalOptions, name: String) -> Result<i32> {
    let path = environment_file(options);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{}\n", name))?;
    eprintln!("Switched to workspace {:?}.", name);
    Ok(EXIT_OK)
}

pub async fn run_workspace_delete(
    options: &GlobalOptions,
    name: String,
    force: bool,
) -> Result<i32> {
    if name == current_workspace(options) {
        bail!("cannot delete the active workspace {:?}", name);
    }
    let config = load_config(options)?.context("cannot load configuration")?;
    let encryption = build_encryption(&config.root.settings)?;
    let backend = build_backend(options, &config.root.settings, encryption)?;
    backend.delete_workspace(&name, force).await?;
    eprintln!("Deleted workspace {:?}.", name);
    Ok(EXIT_OK)
}

pub async fn run_force_unlock(options: &GlobalOptions, lock_id: String) -> Result<i32> {
    let config = load_config(options)?.context("cannot load configuration")?;
    let encryption = build_encryption(&config.root.settings)?;
    let backend = build_backend(options, &config.root.settings, encryption)?;
    backend
        .force_unlock(&current_workspace(options), &lock_id)
        .await?;
    eprintln!("Lock released.");
    Ok(EXIT_OK)
}
