//! Sraline SRA - quality-gated acquisition of sequencing runs
//!
//! Pages through the NCBI SRA catalog, downloads each page's runs with a
//! bounded pool and keeps only the files FastQC does not flag.
//!
//! # Features
//!
//! - E-utilities search + batched runinfo resolve, parsed with quick-xml
//! - Parallel downloads (1-8 workers) with size verification
//! - Serialized FastQC gate with guaranteed scratch cleanup
//! - JSONL event stream for monitoring
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sraline_core::ProgressContext;
//! use sraline_sra::{Config, run};
//!
//! let config = Config {
//!     query: "\"mus musculus\"[Organism] AND chip-seq".into(),
//!     target: 5,
//!     ..Default::default()
//! };
//!
//! let summary = run(&config, Arc::new(ProgressContext::new()))?;
//! println!("{} clean datasets, shortfall {}", summary.state.accepted, summary.shortfall());
//! ```

pub mod catalog;
pub mod config;
pub mod gate;
pub mod runner;
pub mod state;
pub mod worker;

// Re-exports
pub use catalog::{Catalog, EutilsCatalog, SearchPage};
pub use config::{Config, MAX_WORKERS, MIN_WORKERS, clamp_workers};
pub use gate::{FastqcInspector, GateError, Inspector, QualityGate, parse_summary};
pub use runner::{Controller, RunSummary, run};
pub use state::{
    Candidate, DownloadOutcome, DownloadStatus, ItemDescriptor, PartialReason, PipelineState,
    QualityVerdict, RunOutcome, VerdictKind, is_safe_identifier,
};
pub use worker::{BlobTransport, FetchPool, HttpTransport};
