//! `lilly` – interactive runtime entry point.
//!
//! 1. Resolves the runtime system settings (exit code 2 on failure).
//! 2. Installs `tracing` diagnostics from the resolved level and format.
//! 3. Builds the runtime logger and the interactive heartbeat loop.
//! 4. Routes **Ctrl-C** to a cooperative stop.
//! 5. Runs until `stop`, `quit`, `exit` or end of input.

mod config;
mod console;
mod runner;

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use lilly_runtime::{RuntimeLogger, StdinSource, init_tracing};
use lilly_types::RuntimeSystemSettings;
use tracing::{error, warn};

use crate::console::RustylineSource;
use crate::runner::{RunnerOptions, run_interactive};

fn main() -> ExitCode {
    let resolution = match config::resolve() {
        Ok(resolution) => resolution,
        Err(e) => {
            eprintln!("{}: {e}", "Settings error".red().bold());
            return ExitCode::from(2);
        }
    };
    let settings = resolution.settings.clone();

    let _guard = init_tracing("lilly", settings.log_level, settings.log_format);
    resolution.report();

    print_banner(&settings);

    let logger = Arc::new(RuntimeLogger::new(config::logging_config_from_env()));
    let console = if std::io::stdin().is_terminal() {
        RustylineSource::opener()
    } else {
        StdinSource::opener()
    };
    let options = RunnerOptions::new(settings)
        .with_runtime_logger(&logger)
        .with_console(console)
        .force_stop_failure(config::force_stop_failure_from_env());

    let mut heartbeat = run_interactive(options);

    let stop = heartbeat.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.request_stop(Some("interrupted"))) {
        warn!(error = %e, "Failed to install Ctrl-C handler; use `quit` to stop");
    }

    match heartbeat.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "runtime stopped with an unhandled failure");
            eprintln!("{}: {e}", "Runtime failure".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn print_banner(settings: &RuntimeSystemSettings) {
    println!();
    println!("  {} {}", "Lilly".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Interactive runtime");
    println!(
        "  tick {}  log {} / {}  console {}",
        format!("{}ms", settings.tick_interval_ms).bold(),
        settings.log_level.to_string().bold(),
        settings.log_format.to_string().bold(),
        if settings.async_enabled { "on".green() } else { "off".yellow() },
    );
    println!("  Type {} to stop.\n", "quit".bold().cyan());
}
