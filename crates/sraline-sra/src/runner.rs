//! Acquisition controller
//!
//! Pages through the catalog, downloads each page on the fetch pool and gates
//! every finished download on this thread until enough datasets were
//! accepted or the catalog runs dry.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use sraline_core::{
    CancelFlag, CatalogError, Counters, EventEmitter, EventKind, ProgressContext, RetryPolicy,
    SharedProgress, retry_with_backoff, shutdown_flag,
};

use crate::catalog::{Catalog, EutilsCatalog};
use crate::config::Config;
use crate::gate::{FastqcInspector, QualityGate};
use crate::state::{
    DownloadOutcome, DownloadStatus, ItemDescriptor, PartialReason, PipelineState, RunOutcome,
    VerdictKind,
};
use crate::worker::{FetchPool, HttpTransport};

/// Pipeline execution summary
#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub state: PipelineState,
    pub elapsed: Duration,
    pub download_failures: usize,
    pub quality_rejections: usize,
    pub gate_failures: usize,
    /// Inspector invocations
    pub inspected: usize,
}

impl RunSummary {
    /// Accepted datasets still missing
    pub fn shortfall(&self) -> usize {
        self.state.shortfall()
    }

    pub fn log(&self) {
        log::info!("=== SRA Acquisition Summary ===");
        log::info!("Outcome: {}", self.outcome);
        log::info!(
            "Accepted: {}/{} ({} checked)",
            self.state.accepted,
            self.state.target,
            self.state.checked
        );
        log::info!(
            "Rejected: {} quality, {} gate errors, {} download failures",
            self.quality_rejections,
            self.gate_failures,
            self.download_failures
        );
        if self.shortfall() > 0 {
            log::warn!("Shortfall: {} datasets", self.shortfall());
        }
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
    }
}

/// One resolved catalog page
#[derive(Debug)]
struct Page {
    items: Vec<ItemDescriptor>,
    /// Candidates the resolve step returned no run for
    unresolved: usize,
}

enum Phase {
    FetchingCandidates,
    AwaitingBatch(Page),
    EvaluatingStop,
    Done(RunOutcome),
}

#[derive(Debug, Default)]
struct Tally {
    download_failures: usize,
    quality_rejections: usize,
    gate_failures: usize,
    inspected: usize,
}

/// Drives one acquisition run. Owns all counters; workers only report back
/// through the outcome channel.
pub struct Controller {
    catalog: Box<dyn Catalog>,
    pool: FetchPool,
    gate: QualityGate,
    events: EventEmitter,
    cancel: CancelFlag,
    progress: SharedProgress,
    query: String,
    page_size: usize,
    catalog_retry: RetryPolicy,
    state: PipelineState,
    tally: Tally,
}

impl Controller {
    pub fn new(
        config: &Config,
        catalog: Box<dyn Catalog>,
        pool: FetchPool,
        gate: QualityGate,
        events: EventEmitter,
    ) -> Self {
        Self {
            catalog,
            pool,
            gate,
            events,
            cancel: CancelFlag::new(),
            progress: Arc::new(ProgressContext::hidden()),
            query: config.query.clone(),
            page_size: config.page_size.max(1),
            catalog_retry: config.catalog_retry,
            state: PipelineState::new(config.target),
            tally: Tally::default(),
        }
    }

    /// Stop between pages (and abort in-flight downloads) once `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Run until the target is met, the catalog is exhausted or unavailable,
    /// or cancellation is requested.
    pub fn run(mut self) -> RunSummary {
        let start = Instant::now();
        let stage = self.progress.stage_line("acquire");

        self.events.emit_counters(
            EventKind::Start,
            self.counters(),
            format!(
                "Starting acquisition: {} datasets for {:?} ({} workers)",
                self.state.target,
                self.query,
                self.pool.workers()
            ),
        );

        let mut phase = Phase::FetchingCandidates;
        let outcome = loop {
            phase = match phase {
                Phase::FetchingCandidates => self.fetch_candidates(&stage),
                Phase::AwaitingBatch(page) => {
                    self.process_page(page, &stage);
                    Phase::EvaluatingStop
                }
                Phase::EvaluatingStop => self.evaluate_stop(),
                Phase::Done(outcome) => break outcome,
            };
        };
        stage.finish_and_clear();

        let message = match &outcome {
            RunOutcome::Success => format!(
                "Target reached: {} clean datasets after checking {}",
                self.state.accepted, self.state.checked
            ),
            RunOutcome::Partial(reason) => format!(
                "Stopped ({reason}): {} of {} clean datasets after checking {}",
                self.state.accepted, self.state.target, self.state.checked
            ),
        };
        self.events
            .emit_counters(EventKind::Complete, self.counters(), message);

        RunSummary {
            outcome,
            state: self.state,
            elapsed: start.elapsed(),
            download_failures: self.tally.download_failures,
            quality_rejections: self.tally.quality_rejections,
            gate_failures: self.tally.gate_failures,
            inspected: self.tally.inspected,
        }
    }

    fn counters(&self) -> Counters {
        Counters {
            checked: self.state.checked,
            accepted: self.state.accepted,
            target: self.state.target,
        }
    }

    /// Search + resolve the page at the cursor, retrying the same cursor on failure.
    fn fetch_candidates(&mut self, stage: &ProgressBar) -> Phase {
        if self.cancel.is_cancelled() {
            return Phase::Done(RunOutcome::Partial(PartialReason::Cancelled));
        }

        let cursor = self.state.cursor;
        self.events.emit(
            EventKind::Search,
            format!("Searching catalog: offset {cursor}, {} per page", self.page_size),
        );
        stage.set_message(format!("searching (offset {cursor})"));

        let label = format!("catalog page @{cursor}");
        let catalog = self.catalog.as_ref();
        let (query, page_size) = (self.query.as_str(), self.page_size);
        let result = retry_with_backoff(&label, &self.catalog_retry, &self.cancel, stage, |_| {
            fetch_page(catalog, query, page_size, cursor)
        });

        match result {
            Ok((_, None)) => {
                self.events
                    .emit(EventKind::Info, "No more candidates in the catalog");
                Phase::Done(RunOutcome::Partial(PartialReason::Exhausted))
            }
            Ok((total, Some(page))) => {
                self.state.total_available = Some(total);
                self.events.emit(
                    EventKind::Info,
                    format!(
                        "Resolved {} runs at offset {cursor} ({total} available)",
                        page.items.len()
                    ),
                );
                Phase::AwaitingBatch(page)
            }
            Err(_) if self.cancel.is_cancelled() => {
                Phase::Done(RunOutcome::Partial(PartialReason::Cancelled))
            }
            Err(e) => {
                self.events.emit(EventKind::Fail, e.to_string());
                Phase::Done(RunOutcome::Partial(PartialReason::CatalogUnavailable(
                    e.to_string(),
                )))
            }
        }
    }

    /// Download the page and gate each success as it arrives.
    fn process_page(&mut self, page: Page, stage: &ProgressBar) {
        let submitted = page.items.len();
        stage.set_message(format!("downloading {submitted} runs"));

        let mut received = 0;
        for outcome in self.pool.submit_batch(page.items) {
            received += 1;
            self.handle_outcome(outcome, stage);
        }

        let lost = submitted - received;
        if lost > 0 {
            log::error!("{lost} downloads ended without reporting back");
            self.tally.download_failures += lost;
        }
        if page.unresolved > 0 {
            self.events.emit(
                EventKind::Info,
                format!("{} candidates had no downloadable run", page.unresolved),
            );
        }
        for _ in 0..lost + page.unresolved {
            self.state.record(false);
        }

        let message = format!(
            "Clean datasets collected: {}/{} ({} checked)",
            self.state.accepted, self.state.target, self.state.checked
        );
        self.events
            .emit_counters(EventKind::Progress, self.counters(), message);
    }

    fn handle_outcome(&mut self, outcome: DownloadOutcome, stage: &ProgressBar) {
        let id = outcome.identifier.as_str();
        let file = outcome
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match &outcome.status {
            DownloadStatus::Fetched { bytes } => self.events.emit_item(
                EventKind::Download,
                id,
                format!("Downloaded {file} ({bytes} bytes)"),
            ),
            DownloadStatus::AlreadyPresent => self.events.emit_item(
                EventKind::Download,
                id,
                format!("Using existing {file}"),
            ),
            DownloadStatus::Failed(e) => {
                self.events
                    .emit_item(EventKind::Fail, id, format!("Download failed for {id}: {e}"));
                self.tally.download_failures += 1;
                self.state.record(false);
                return;
            }
        }

        if self.cancel.is_cancelled() {
            remove_blob(&outcome.local_path);
            self.events.emit_item(
                EventKind::Info,
                id,
                format!("Skipping inspection of {id}: cancelled"),
            );
            self.state.record(false);
            return;
        }

        stage.set_message(format!("inspecting {id}"));
        self.events.emit_item(
            EventKind::Analysis,
            id,
            format!("Running {} on {file}", self.gate.inspector_name()),
        );
        let verdict = self.gate.inspect(id, &outcome.local_path);
        self.tally.inspected += 1;
        self.state.record(verdict.accepted());

        match verdict.kind {
            VerdictKind::Passed => self.events.emit_item(
                EventKind::Pass,
                id,
                format!(
                    "{id} passed quality control ({}/{})",
                    self.state.accepted, self.state.target
                ),
            ),
            VerdictKind::QualityRejected => {
                self.tally.quality_rejections += 1;
                self.events.emit_item(
                    EventKind::Fail,
                    id,
                    format!("{id} failed quality control: {}", verdict.diagnostic),
                );
            }
            VerdictKind::GateFailure => {
                self.tally.gate_failures += 1;
                self.events.emit_item(
                    EventKind::Fail,
                    id,
                    format!("{id} could not be inspected: {}", verdict.diagnostic),
                );
            }
        }
    }

    fn evaluate_stop(&mut self) -> Phase {
        if self.state.target_met() {
            return Phase::Done(RunOutcome::Success);
        }
        if self.cancel.is_cancelled() {
            return Phase::Done(RunOutcome::Partial(PartialReason::Cancelled));
        }
        let total = self.state.total_available.unwrap_or(0);
        if self.state.cursor + self.page_size >= total {
            return Phase::Done(RunOutcome::Partial(PartialReason::Exhausted));
        }
        self.state.cursor += self.page_size;
        Phase::FetchingCandidates
    }
}

fn remove_blob(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {e}", path.display());
        }
    }
}

/// One search + resolve attempt. `None` page = no candidates left.
fn fetch_page(
    catalog: &dyn Catalog,
    query: &str,
    page_size: usize,
    cursor: usize,
) -> Result<(usize, Option<Page>), CatalogError> {
    let search = catalog.search(query, page_size, cursor)?;
    if search.candidates.is_empty() {
        return Ok((search.total_available, None));
    }

    let resolved = catalog.resolve(&search.candidates)?;
    let mut seen = HashSet::new();
    let items: Vec<ItemDescriptor> = resolved
        .into_iter()
        .filter(|item| {
            let fresh = seen.insert(item.identifier.clone());
            if !fresh {
                log::debug!("{}: listed twice in one page, keeping first", item.identifier);
            }
            fresh
        })
        .collect();

    let unresolved = search.candidates.len().saturating_sub(items.len());
    Ok((search.total_available, Some(Page { items, unresolved })))
}

/// Run one acquisition against NCBI with FastQC as the inspector.
///
/// Honors the process-wide shutdown flag set by the signal handler.
pub fn run(config: &Config, progress: SharedProgress) -> Result<RunSummary> {
    config.validate()?;

    let workers = config.effective_workers();
    if workers != config.workers {
        log::warn!(
            "Requested {} workers, using {workers} (allowed range 1-8)",
            config.workers
        );
    }

    let events = match &config.event_log {
        Some(path) => EventEmitter::new()
            .with_log_file(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?,
        None => EventEmitter::new(),
    };

    let catalog = EutilsCatalog::new(&config.eutils_base, &config.trace_base)
        .with_credentials(config.api_key.clone(), config.email.clone());

    let cancel = shutdown_flag();
    let pool = FetchPool::new(
        workers,
        &config.scratch_dir,
        Arc::new(HttpTransport),
        cancel.clone(),
        Arc::clone(&progress),
    )?
    .with_download_timeout(config.download_timeout);

    let gate = QualityGate::new(
        Arc::new(FastqcInspector::new(&config.fastqc_path)),
        &config.inspect_dir,
        &config.clean_dir,
    )
    .with_timeout(config.inspection_timeout);

    let summary = Controller::new(config, Box::new(catalog), pool, gate, events)
        .with_cancel(cancel)
        .with_progress(progress)
        .run();
    summary.log();
    Ok(summary)
}
