mod apply;
mod cache;
mod cli;
mod config;
mod deplock;
mod encryption;
mod eval;
mod graph;
mod interrupt;
mod logging;
mod plan;
mod provider;
mod state;
#[cfg(test)]
mod testing;

use std::io::IsTerminal as _;
use std::process::exit;

use anyhow::Result;
use clap::{ColorChoice, CommandFactory as _, Parser, Subcommand};
use interrupt::{set_up_process_interrupt_handler, InterruptState};

fn main() {
    let interrupt_state = set_up_process_interrupt_handler();
    let args = Args::parse();
    match run_args(&interrupt_state, args) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("groundwork error: {:?}", e);
            exit(cli::EXIT_ERROR);
        }
    }
}

fn run_args(interrupt_state: &InterruptState, args: Args) -> Result<i32> {
    if let Commands::GenerateCompletion { shell } = &args.command {
        let mut cmd = Args::command();
        clap_complete::generate(*shell, &mut cmd, "groundwork", &mut std::io::stdout());
        return Ok(cli::EXIT_OK);
    }

    logging::init(&logging::Options {
        verbose: args.options.verbose,
        color: determine_color(args.options.color),
    })?;
    let global = to_global_options(&args.options);

    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(async {
        match args.command {
            Commands::Plan(plan_args) => {
                cli::run_plan(interrupt_state, &global, to_plan_command(plan_args)).await
            }
            Commands::Apply(apply_args) => {
                cli::run_apply(
                    interrupt_state,
                    &global,
                    cli::ApplyCommand {
                        plan_file: apply_args.plan_file,
                        var_args: to_var_args(apply_args.vars, apply_args.var_files),
                    },
                )
                .await
            }
            Commands::Destroy(plan_args) => {
                let mut cmd = to_plan_command(plan_args);
                cmd.destroy = true;
                cli::run_plan(interrupt_state, &global, cmd).await
            }
            Commands::Validate => cli::run_validate(&global).await,
            Commands::Show => cli::run_show(&global).await,
            Commands::Providers(Providers::Lock { upgrade, platforms }) => {
                cli::run_providers_lock(&global, upgrade, platforms).await
            }
            Commands::Workspace(cmd) => match cmd {
                Workspace::List => cli::run_workspace_list(&global).await,
                Workspace::Select { name } => cli::run_workspace_select(&global, name).await,
                Workspace::Delete { name, force } => {
                    cli::run_workspace_delete(&global, name, force).await
                }
            },
            Commands::ForceUnlock { lock_id } => cli::run_force_unlock(&global, lock_id).await,
            Commands::GenerateCompletion { .. } => unreachable!("handled above"),
        }
    })?;

    Ok(code)
}

fn determine_color(choice: ColorChoice) -> bool {
    match choice {
        ColorChoice::Auto => std::io::stderr().is_terminal(),
        ColorChoice::Always => true,
        ColorChoice::Never => false,
    }
}

fn to_global_options(options: &Options) -> cli::GlobalOptions {
    cli::GlobalOptions {
        chdir: options.chdir.clone(),
        parallelism: options.parallelism.max(1),
        lock_timeout_secs: options.lock_timeout,
        consolidate_warnings: options.consolidate_warnings,
    }
}

fn to_var_args(vars: Vec<String>, var_files: Vec<std::path::PathBuf>) -> cli::VarArgs {
    // clap collects flags by kind; files keep their relative precedence by
    // coming before the loose -var flags, matching last-wins semantics.
    let mut args = Vec::new();
    for f in var_files {
        args.push(config::variables::CliArg::VarFile(f));
    }
    for v in vars {
        args.push(config::variables::CliArg::Var(v));
    }
    cli::VarArgs { vars: args }
}

fn to_plan_command(args: PlanArgs) -> cli::PlanCommand {
    cli::PlanCommand {
        out: args.out,
        detailed_exitcode: args.detailed_exitcode,
        refresh: !args.no_refresh,
        refresh_only: args.refresh_only,
        destroy: args.destroy,
        json: args.json,
        targets: args.targets,
        replace: args.replace,
        var_args: to_var_args(args.vars, args.var_files),
    }
}

/// Groundwork: manage external resources declaratively
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Parser, Debug, Clone)]
struct Options {
    #[arg(short, long, global = true, default_value = "false")]
    verbose: bool,

    #[arg(long, global = true, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Run as if started in this directory
    #[arg(long, global = true)]
    chdir: Option<std::path::PathBuf>,

    /// Maximum concurrent resource operations
    #[arg(long, global = true, default_value_t = 10)]
    parallelism: usize,

    /// Seconds to retry acquiring the state lock
    #[arg(long, global = true, default_value_t = 0)]
    lock_timeout: u64,

    /// Group repeated deprecation warnings
    #[arg(long, global = true, default_value_t = false)]
    consolidate_warnings: bool,
}

#[derive(Parser, Debug)]
struct PlanArgs {
    /// Write the plan to this file for later apply
    #[arg(long)]
    out: Option<std::path::PathBuf>,

    /// Exit 2 instead of 0 when the plan contains changes
    #[arg(long)]
    detailed_exitcode: bool,

    /// Skip reading live resource state before planning
    #[arg(long)]
    no_refresh: bool,

    /// Only refresh state; plan no changes
    #[arg(long, conflicts_with = "destroy")]
    refresh_only: bool,

    /// Plan the destruction of all managed resources
    #[arg(long)]
    destroy: bool,

    /// Print the plan in the machine-readable JSON format
    #[arg(long)]
    json: bool,

    /// Restrict planning to these resource addresses
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Force replacement of these resource instances
    #[arg(long = "replace")]
    replace: Vec<String>,

    /// Set a variable, name=value
    #[arg(long = "var")]
    vars: Vec<String>,

    /// Load variable values from a file
    #[arg(long = "var-file")]
    var_files: Vec<std::path::PathBuf>,
}

#[derive(Parser, Debug)]
struct ApplyArgs {
    /// A plan file produced by `plan -out`; omit to plan and apply
    plan_file: Option<std::path::PathBuf>,

    /// Set a variable, name=value
    #[arg(long = "var")]
    vars: Vec<String>,

    /// Load variable values from a file
    #[arg(long = "var-file")]
    var_files: Vec<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Providers {
    /// Write the dependency lock file for the configured providers
    Lock {
        /// Reselect versions within constraints
        #[arg(long)]
        upgrade: bool,

        /// Platforms that must be covered by recorded checksums
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum Workspace {
    /// List workspaces
    List,
    /// Switch to another workspace
    Select { name: String },
    /// Delete a workspace
    Delete {
        name: String,
        /// Delete even if the workspace still tracks resources
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the changes required to reach the desired state
    Plan(PlanArgs),

    /// Apply the planned changes
    Apply(ApplyArgs),

    /// Destroy all managed resources
    Destroy(PlanArgs),

    /// Check the configuration for errors
    Validate,

    /// Print the current state in the machine-readable JSON format
    Show,

    /// Commands for managing provider plugins
    #[command(subcommand)]
    Providers(Providers),

    /// Commands for managing workspaces
    #[command(subcommand)]
    Workspace(Workspace),

    /// Remove a stale state lock
    ForceUnlock { lock_id: String },

    /// Generate shell completion for groundwork
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
