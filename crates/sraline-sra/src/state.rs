//! Pipeline state types for SRA acquisition

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use sraline_core::TransportError;

/// Filename suffix of every downloaded blob and clean-store entry
pub const BLOB_SUFFIX: &str = ".fastq.gz";

/// Catalog entry returned by a search, not yet resolved
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub uid: String,
}

/// Everything needed to fetch one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// Run accession (e.g. `SRR32410640`); drives every derived filename
    pub identifier: String,
    /// Download URL
    pub locator: String,
    /// Size hint from the catalog (bytes), informational only
    pub declared_size: Option<u64>,
    /// Raw catalog attributes, lower-cased keys
    pub attributes: BTreeMap<String, String>,
}

impl ItemDescriptor {
    /// `<identifier>.fastq.gz`
    pub fn file_name(&self) -> String {
        blob_file_name(&self.identifier)
    }
}

pub fn blob_file_name(identifier: &str) -> String {
    format!("{identifier}{BLOB_SUFFIX}")
}

/// Whether `identifier` can be used as a single path component.
///
/// Accepts `[A-Za-z0-9_.-]+` except `.` and `..`. Identifiers come from the
/// remote catalog and are joined into scratch, inspector and clean-store paths.
pub fn is_safe_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier != "."
        && identifier != ".."
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// How a download ended
#[derive(Debug)]
pub enum DownloadStatus {
    /// Streamed and size-verified
    Fetched { bytes: u64 },
    /// Blob already on scratch storage from an earlier attempt
    AlreadyPresent,
    Failed(TransportError),
}

/// Result of the fetch stage for one item
#[derive(Debug)]
pub struct DownloadOutcome {
    pub identifier: String,
    pub local_path: PathBuf,
    pub status: DownloadStatus,
}

impl DownloadOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self.status, DownloadStatus::Failed(_))
    }

    pub fn failure_reason(&self) -> Option<String> {
        match &self.status {
            DownloadStatus::Failed(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

/// Why the gate decided the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    Passed,
    /// Report present, at least one failing check
    QualityRejected,
    /// Inspector errored or produced no report
    GateFailure,
}

/// Quality gate decision for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityVerdict {
    pub identifier: String,
    pub kind: VerdictKind,
    pub diagnostic: String,
}

impl QualityVerdict {
    pub fn accepted(&self) -> bool {
        self.kind == VerdictKind::Passed
    }
}

/// Counters owned by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    pub target: usize,
    pub accepted: usize,
    pub checked: usize,
    /// Offset of the page currently being processed
    pub cursor: usize,
    /// Catalog total from the most recent search
    pub total_available: Option<usize>,
}

impl PipelineState {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    /// Count one finished item. Keeps `accepted <= checked`.
    pub fn record(&mut self, accepted: bool) {
        self.checked += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    pub fn target_met(&self) -> bool {
        self.accepted >= self.target
    }

    /// Accepted datasets still missing
    pub fn shortfall(&self) -> usize {
        self.target.saturating_sub(self.accepted)
    }
}

/// Why a run stopped before reaching its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartialReason {
    /// Catalog has no more candidates
    Exhausted,
    /// Same-page retries used up
    CatalogUnavailable(String),
    Cancelled,
}

impl fmt::Display for PartialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("catalog exhausted"),
            Self::CatalogUnavailable(e) => write!(f, "{e}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Terminal controller state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Partial(PartialReason),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Partial(reason) => write!(f, "partial ({reason})"),
        }
    }
}
