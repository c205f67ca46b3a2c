//! Status subcommand: replay the event log of the latest run

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Args;
use sraline_core::{ProgressSnapshot, read_event_log};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Event log to read (default: from config)
    #[arg(long)]
    pub event_log: Option<PathBuf>,
}

pub fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let path = args
        .event_log
        .unwrap_or_else(|| config.output.event_log.clone());

    let events = read_event_log(&path)
        .with_context(|| format!("Failed to read event log {}", path.display()))?;
    if events.is_empty() {
        anyhow::bail!("No events recorded in {}", path.display());
    }

    let snapshot = ProgressSnapshot::from_events(&events);
    super::print_table("Status", &snapshot_rows(&snapshot));
    Ok(())
}

fn snapshot_rows(snapshot: &ProgressSnapshot) -> Vec<(&'static str, String)> {
    let counters = &snapshot.counters;
    let state = if snapshot.complete {
        "complete"
    } else {
        "running or interrupted"
    };
    let mut rows = vec![
        ("State", state.to_string()),
        ("Target", counters.target.to_string()),
        ("Clean datasets", counters.accepted.to_string()),
        ("Datasets checked", counters.checked.to_string()),
        ("Success rate", format!("{:.1}%", snapshot.success_rate())),
        (
            "Gate verdicts",
            format!("{} passed, {} failed", snapshot.passed, snapshot.failed),
        ),
    ];
    if let Some(message) = &snapshot.last_message {
        rows.push(("Last event", message.clone()));
    }
    if let Some(ts) = snapshot.last_timestamp {
        rows.push((
            "Updated",
            ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        ));
    }
    rows
}
