//! Acquire subcommand: collect N clean datasets for a search term

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use sraline_core::SharedProgress;
use sraline_sra::{PartialReason, RunOutcome, RunSummary};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct AcquireArgs {
    /// Entrez search term, e.g. '"mus musculus"[Organism] AND chip-seq'
    #[arg(short, long)]
    pub term: String,

    /// Number of clean datasets to collect
    #[arg(short = 'n', long, value_parser = parse_positive)]
    pub num_datasets: usize,

    /// Parallel downloads (1-8)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Candidates fetched per catalog page
    #[arg(long, value_parser = parse_positive)]
    pub page_size: Option<usize>,

    /// Download scratch directory
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Directory for accepted files
    #[arg(long)]
    pub clean_dir: Option<PathBuf>,

    /// JSONL event log (appended)
    #[arg(long)]
    pub event_log: Option<PathBuf>,

    /// Don't write an event log
    #[arg(long, conflicts_with = "event_log")]
    pub no_event_log: bool,

    /// FastQC executable
    #[arg(long)]
    pub fastqc_path: Option<PathBuf>,
}

fn parse_positive(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Process exit status for a finished run: 0 target met, 3 partial, 130 cancelled
pub fn exit_status(outcome: &RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => 0,
        RunOutcome::Partial(PartialReason::Cancelled) => 130,
        RunOutcome::Partial(_) => 3,
    }
}

/// Merge command-line overrides into the file configuration
fn pipeline_config(args: AcquireArgs, config: &Config) -> sraline_sra::Config {
    let mut pipeline = config.pipeline_config();
    pipeline.query = args.term;
    pipeline.target = args.num_datasets;
    if let Some(workers) = args.workers {
        pipeline.workers = workers;
    }
    if let Some(page_size) = args.page_size {
        pipeline.page_size = page_size;
    }
    if let Some(dir) = args.scratch_dir {
        pipeline.scratch_dir = dir;
    }
    if let Some(dir) = args.clean_dir {
        pipeline.clean_dir = dir;
    }
    if let Some(path) = args.fastqc_path {
        pipeline.fastqc_path = path;
    }
    if args.no_event_log {
        pipeline.event_log = None;
    } else if let Some(path) = args.event_log {
        pipeline.event_log = Some(path);
    }
    pipeline
}

pub fn run(args: AcquireArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let pipeline = pipeline_config(args, config);

    log::info!("Acquiring {} datasets for {:?}", pipeline.target, pipeline.query);
    log::info!("  Clean store: {}", pipeline.clean_dir.display());
    if let Some(path) = &pipeline.event_log {
        log::info!("  Event log: {}", path.display());
    }

    let summary = sraline_sra::run(&pipeline, progress.clone())?;
    super::print_table("Acquisition", &summary_rows(&summary));

    Ok(ExitCode::from(exit_status(&summary.outcome)))
}

fn summary_rows(summary: &RunSummary) -> Vec<(&'static str, String)> {
    let state = &summary.state;
    vec![
        ("Outcome", summary.outcome.to_string()),
        ("Target", state.target.to_string()),
        ("Clean datasets", state.accepted.to_string()),
        ("Datasets checked", state.checked.to_string()),
        ("Shortfall", summary.shortfall().to_string()),
        (
            "Rejected",
            format!(
                "{} quality, {} inspector errors, {} downloads",
                summary.quality_rejections, summary.gate_failures, summary.download_failures
            ),
        ),
        ("Time", format!("{:.1}s", summary.elapsed.as_secs_f64())),
    ]
}
