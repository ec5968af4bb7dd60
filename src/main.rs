use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use timeline_extractor::cli::{Args, Commands};
use timeline_extractor::config::ExtractionConfig;
use timeline_extractor::constants::{EXIT_ABORTED, EXIT_CONFIGURATION_ERROR};
use timeline_extractor::engine::{run_child_process, AbortSignal, ExtractionFrontend, InterruptAction};
use timeline_extractor::error::EngineError;
use timeline_extractor::utils::summary::{create_run_report, RunSummary};

fn main() -> Result<()> {
    // Parse arguments
    let args = Args::parse();

    if let Some(Commands::Child) = &args.command {
        // Stdout of a child carries its handshake
        initialize_logging(args.verbose, TerminalMode::Stderr)?;
        return run_child();
    }

    initialize_logging(args.verbose, TerminalMode::Mixed)?;
    info!("Starting timeline extraction");

    let config = match ExtractionConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(EXIT_CONFIGURATION_ERROR);
        }
    };

    let mut frontend = ExtractionFrontend::new(config).with_verbose(args.verbose);
    install_interrupt_handler(frontend.abort_signal())?;

    match frontend.process_source() {
        Ok(summary) => {
            let report_path = write_run_report(&frontend.config().output, &summary)?;
            info!("Run summary written to {}", report_path.display());
            info!(
                "{} events and {} extraction errors written to {}",
                summary.events, summary.errors, summary.output_file
            );
            info!(
                "Workers: {} completed, {} terminated",
                summary.workers_completed, summary.workers_terminated
            );
            Ok(())
        }
        Err(EngineError::Aborted) => {
            warn!("Extraction aborted");
            process::exit(EXIT_ABORTED);
        }
        Err(e) if e.is_fatal_before_extraction() => {
            error!("{}", e);
            process::exit(EXIT_CONFIGURATION_ERROR);
        }
        Err(e) => Err(e).context("Extraction failed"),
    }
}

/// Initialize logging with the specified verbosity level
fn initialize_logging(verbose: bool, mode: TerminalMode) -> Result<()> {
    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    TermLogger::init(log_level, Config::default(), mode, ColorChoice::Auto)
        .context("Failed to initialize logger")?;
    Ok(())
}

/// Child processes leave interrupts to the orchestrator
fn run_child() -> Result<()> {
    ctrlc::set_handler(|| {}).context("Failed to install interrupt handler")?;
    let stdin = io::stdin();
    run_child_process(stdin.lock())
}

fn install_interrupt_handler(abort: Arc<AbortSignal>) -> Result<()> {
    ctrlc::set_handler(move || match abort.interrupt() {
        InterruptAction::ExitNow => process::exit(EXIT_ABORTED),
        InterruptAction::Abort => warn!("Stopping the extraction, interrupt again to force"),
        InterruptAction::Escalate => {
            let killed = abort.kill_children();
            warn!("Terminated {} child processes", killed);
            process::exit(EXIT_ABORTED);
        }
    })
    .context("Failed to install interrupt handler")
}

/// Write the run report next to the storage file
fn write_run_report(output: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let report = create_run_report(summary)?;
    let mut report_path = output.as_os_str().to_owned();
    report_path.push(".summary.json");
    let report_path = PathBuf::from(report_path);

    fs::write(&report_path, report).context("Failed to write run summary")?;
    Ok(report_path)
}
