//! Tracing output for the CLI.
//!
//! Everything goes to stderr; stdout is reserved for machine-readable
//! command output (`plan --json`, `show`). The filter can be overridden
//! with `GW_LOG` using the usual tracing directive syntax, e.g.
//! `GW_LOG=groundwork::provider=trace`.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

pub(crate) struct Options {
    pub verbose: bool,
    pub color: bool,
}

pub(crate) fn init(options: &Options) -> Result<()> {
    let default_directives = if options.verbose {
        // Engine internals at trace, dependencies at info.
        "info,groundwork=trace"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_env("GW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    // Span close events carry per-operation timings; they are only worth
    // the noise when someone asked for detail.
    let span_events = if options.verbose {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_ansi(options.color)
        .with_target(options.verbose)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logging: {}", e))
}
