//! sraline - quality-gated acquisition of SRA sequencing runs
//!
//! Searches the NCBI SRA catalog, downloads candidate runs in parallel and
//! keeps only those whose FastQC report shows no failing check.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sraline_core::{ProgressContext, SharedProgress, init_logging, request_shutdown};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "sraline")]
#[command(about = "Collect sequencing runs from SRA that pass FastQC")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Config file path (default: ./sraline.toml or ~/.config/sraline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Read timeout in seconds for stall detection
    #[arg(long, global = true)]
    read_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Download runs matching a search term until enough pass quality control
    Acquire(cmd::acquire::AcquireArgs),
    /// Summarize the latest run from its event log
    Status(cmd::status::StatusArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(ProgressContext::new());
    let multi = if progress.is_tty() {
        Some(progress.multi())
    } else {
        None
    };
    if let Err(e) = init_logging(cli.quiet, cli.debug, multi) {
        eprintln!("Failed to initialize logging: {e}");
    }

    match run(cli, &progress) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, progress: &SharedProgress) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    // Config file defaults, CLI overrides
    let mut http_config = config.http_config();
    if let Some(secs) = cli.read_timeout {
        http_config.read_timeout = Duration::from_secs(secs);
    }
    sraline_core::set_http_config(http_config);

    match cli.command {
        Command::Acquire(args) => {
            setup_signal_handler()?;
            cmd::acquire::run(args, &config, progress)
        }
        Command::Status(args) => {
            cmd::status::run(args, &config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First SIGINT/SIGTERM requests a graceful stop, the second exits immediately.
fn setup_signal_handler() -> Result<()> {
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        // SAFETY: the handler only swaps a static atomic and calls `_exit`,
        // both async-signal-safe
        let registered = unsafe {
            signal_hook::low_level::register(signal, || {
                if request_shutdown() {
                    signal_hook::low_level::exit(130);
                }
            })
        };
        registered.with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }
    Ok(())
}

fn print_config(config: &Config) {
    let secret = |value: &Option<String>| match value {
        Some(_) => "configured".to_string(),
        None => "not set".to_string(),
    };

    cmd::print_table(
        "Setting",
        &[
            ("Scratch directory", config.output.scratch_dir.display().to_string()),
            ("Inspector directory", config.output.inspect_dir.display().to_string()),
            ("Clean directory", config.output.clean_dir.display().to_string()),
            ("Event log", config.output.event_log.display().to_string()),
            ("Workers", format!("{} (range 1-8)", config.workers.default)),
            ("Page size", config.search.page_size.to_string()),
            (
                "Catalog retries",
                format!(
                    "{} attempts, {}s-{}s backoff",
                    config.search.max_catalog_retries,
                    config.search.retry_base,
                    config.search.retry_max
                ),
            ),
            ("E-utilities URL", config.ncbi.eutils_base.clone()),
            ("Download URL", config.ncbi.trace_base.clone()),
            ("NCBI API key", secret(&config.ncbi.api_key)),
            (
                "NCBI email",
                config.ncbi.email.clone().unwrap_or_else(|| "not set".into()),
            ),
            ("FastQC", config.fastqc.path.display().to_string()),
            ("FastQC timeout", format!("{}s", config.fastqc.timeout)),
            ("Read timeout", format!("{}s", config.http.read_timeout)),
            ("Download timeout", format!("{}s", config.http.download_timeout)),
        ],
    );
}
