// Tracing setup
//
// Launcher and workers log to stderr. Worker stderr is redirected into the
// per-rank log files, so colours are only used on a terminal.

use std::io::IsTerminal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Set to `1` to default the filter to `debug`
pub const DEBUG_VAR: &str = "LISA_LAUNCH_DEBUG";

/// Filter used when `RUST_LOG` is not set
pub fn default_directive() -> &'static str {
    match std::env::var(DEBUG_VAR) {
        Ok(v) if v == "1" => "debug",
        _ => "info",
    }
}

pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    // hf-hub logs through the `log` crate
    tracing_log::LogTracer::init().ok();
}
