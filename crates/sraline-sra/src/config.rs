//! SRA acquisition pipeline configuration

use std::path::PathBuf;
use std::time::Duration;

use sraline_core::RetryPolicy;

/// Parallel download bounds; requested worker counts are clamped into this range
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 8;

/// Clamp a requested worker count into `[MIN_WORKERS, MAX_WORKERS]`
pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Runtime configuration for one acquisition run
#[derive(Debug, Clone)]
pub struct Config {
    /// Free-text Entrez query, e.g. `"mus musculus"[Organism] AND chip-seq`
    pub query: String,
    /// Number of accepted datasets wanted
    pub target: usize,
    /// Parallel downloads (clamped to 1..=8 by the fetch pool)
    pub workers: usize,
    /// Candidates requested per catalog page
    pub page_size: usize,
    /// Download scratch directory (`<run>.fastq.gz` while awaiting inspection)
    pub scratch_dir: PathBuf,
    /// Parent of the per-item inspector output directories
    pub inspect_dir: PathBuf,
    /// Accepted files end up here
    pub clean_dir: PathBuf,
    /// Append-only JSONL event log; `None` = log facade only
    pub event_log: Option<PathBuf>,
    /// E-utilities endpoint (with trailing slash)
    pub eutils_base: String,
    /// Fastq download endpoint; the run accession is appended
    pub trace_base: String,
    pub api_key: Option<String>,
    /// Contact address sent to NCBI
    pub email: Option<String>,
    /// FastQC executable
    pub fastqc_path: PathBuf,
    /// Ceiling for one whole download
    pub download_timeout: Duration,
    /// Ceiling for one inspector run
    pub inspection_timeout: Duration,
    /// Same-page retries when the catalog fails
    pub catalog_retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            query: String::new(),
            target: 1,
            workers: 3,
            page_size: 10,
            scratch_dir: PathBuf::from("temp_gz_files"),
            inspect_dir: PathBuf::from("fastqc_temp"),
            clean_dir: PathBuf::from("clean_datasets"),
            event_log: Some(PathBuf::from("sraline-events.jsonl")),
            eutils_base: "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/".to_string(),
            trace_base: "https://trace.ncbi.nlm.nih.gov/Traces/sra-reads-be/fastq?acc="
                .to_string(),
            api_key: std::env::var("NCBI_API_KEY").ok(),
            email: std::env::var("NCBI_EMAIL").ok(),
            fastqc_path: std::env::var_os("FASTQC_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fastqc")),
            download_timeout: Duration::from_secs(4 * 60 * 60),
            inspection_timeout: Duration::from_secs(2 * 60 * 60),
            catalog_retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.query.trim().is_empty(), "search query must not be empty");
        anyhow::ensure!(self.target > 0, "target dataset count must be positive");
        anyhow::ensure!(self.page_size > 0, "page size must be positive");
        anyhow::ensure!(
            self.scratch_dir != self.clean_dir,
            "scratch and clean directories must differ"
        );
        Ok(())
    }

    /// Worker count after clamping
    pub fn effective_workers(&self) -> usize {
        clamp_workers(self.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.page_size, 10);
        assert_eq!(config.workers, 3);
        assert_eq!(config.clean_dir, PathBuf::from("clean_datasets"));
        assert!(config.eutils_base.starts_with("https://"));
        assert!(config.eutils_base.ends_with('/'));
        assert!(config.download_timeout > Duration::ZERO);
        assert!(config.inspection_timeout > Duration::ZERO);
    }

    #[test]
    fn workers_are_clamped() {
        assert_eq!(clamp_workers(0), 1);
        assert_eq!(clamp_workers(1), 1);
        assert_eq!(clamp_workers(5), 5);
        assert_eq!(clamp_workers(8), 8);
        assert_eq!(clamp_workers(64), 8);
    }

    #[test]
    fn validate_rejects_empty_query() {
        let config = Config {
            query: "   ".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_target() {
        let config = Config {
            query: "chip-seq".into(),
            target: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_sane_config() {
        let config = Config {
            query: "chip-seq".into(),
            target: 3,
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.effective_workers(), 3);
    }
}
