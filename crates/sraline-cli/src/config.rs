//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sraline_core::{HttpConfig, RetryPolicy};

/// Global configuration for sraline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub ncbi: NcbiConfig,
    pub fastqc: FastqcConfig,
    pub workers: WorkersConfig,
    pub search: SearchConfig,
    pub http: HttpSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub scratch_dir: PathBuf,
    pub inspect_dir: PathBuf,
    pub clean_dir: PathBuf,
    pub event_log: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let defaults = sraline_sra::Config::default();
        Self {
            scratch_dir: defaults.scratch_dir,
            inspect_dir: defaults.inspect_dir,
            clean_dir: defaults.clean_dir,
            event_log: PathBuf::from("sraline-events.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NcbiConfig {
    pub eutils_base: String,
    pub trace_base: String,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub email: Option<String>,
}

impl Default for NcbiConfig {
    fn default() -> Self {
        let defaults = sraline_sra::Config::default();
        Self {
            eutils_base: defaults.eutils_base,
            trace_base: defaults.trace_base,
            api_key: defaults.api_key,
            email: defaults.email,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FastqcConfig {
    pub path: PathBuf,
    /// Seconds before a FastQC run is killed
    pub timeout: u64,
}

impl Default for FastqcConfig {
    fn default() -> Self {
        let defaults = sraline_sra::Config::default();
        Self {
            path: defaults.fastqc_path,
            timeout: defaults.inspection_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { default: 3 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub page_size: usize,
    /// Attempts per catalog page, including the first
    pub max_catalog_retries: u32,
    /// First backoff delay in seconds; doubles per attempt
    pub retry_base: u64,
    pub retry_max: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            page_size: 10,
            max_catalog_retries: retry.max_attempts,
            retry_base: retry.base_delay.as_secs(),
            retry_max: retry.max_delay.as_secs(),
        }
    }
}

/// Timeouts in seconds
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub connect_timeout: u64,
    pub request_timeout: u64,
    pub read_timeout: u64,
    pub download_timeout: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        let http = HttpConfig::default();
        Self {
            connect_timeout: http.connect_timeout.as_secs(),
            request_timeout: http.request_timeout.as_secs(),
            read_timeout: http.read_timeout.as_secs(),
            download_timeout: sraline_sra::Config::default().download_timeout.as_secs(),
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./sraline.toml (current directory)
    /// 2. ~/.config/sraline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("sraline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "sraline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Process-wide HTTP settings; NCBI asks for a contact address in the User-Agent
    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.http.connect_timeout),
            request_timeout: Duration::from_secs(self.http.request_timeout),
            read_timeout: Duration::from_secs(self.http.read_timeout),
            user_agent: Some(match &self.ncbi.email {
                Some(email) => format!("sraline/{} (contact: {email})", env!("CARGO_PKG_VERSION")),
                None => format!("sraline/{}", env!("CARGO_PKG_VERSION")),
            }),
        }
    }

    /// Pipeline settings before command-line overrides
    pub fn pipeline_config(&self) -> sraline_sra::Config {
        sraline_sra::Config {
            workers: self.workers.default,
            page_size: self.search.page_size,
            scratch_dir: self.output.scratch_dir.clone(),
            inspect_dir: self.output.inspect_dir.clone(),
            clean_dir: self.output.clean_dir.clone(),
            event_log: Some(self.output.event_log.clone()),
            eutils_base: self.ncbi.eutils_base.clone(),
            trace_base: self.ncbi.trace_base.clone(),
            api_key: self.ncbi.api_key.clone(),
            email: self.ncbi.email.clone(),
            fastqc_path: self.fastqc.path.clone(),
            download_timeout: Duration::from_secs(self.http.download_timeout),
            inspection_timeout: Duration::from_secs(self.fastqc.timeout),
            catalog_retry: RetryPolicy {
                max_attempts: self.search.max_catalog_retries.max(1),
                base_delay: Duration::from_secs(self.search.retry_base),
                max_delay: Duration::from_secs(self.search.retry_max),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.output.clean_dir, PathBuf::from("clean_datasets"));
        assert_eq!(config.output.scratch_dir, PathBuf::from("temp_gz_files"));
        assert_eq!(config.workers.default, 3);
        assert_eq!(config.search.page_size, 10);
        assert_eq!(config.search.max_catalog_retries, 5);
    }

    #[test]
    fn expand_env_var_simple() {
        std::env::set_var("SRALINE_TEST_VAR", "test_value");
        assert_eq!(
            expand_env_var("${SRALINE_TEST_VAR}"),
            Some("test_value".to_string())
        );
        std::env::remove_var("SRALINE_TEST_VAR");
    }

    #[test]
    fn expand_env_var_literal() {
        assert_eq!(expand_env_var("literal"), Some("literal".to_string()));
    }

    #[test]
    fn expand_env_var_missing() {
        assert_eq!(expand_env_var("${NONEXISTENT_VAR_12345}"), None);
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[output]
clean_dir = "/data/clean"
event_log = "/data/events.jsonl"

[ncbi]
email = "lab@example.org"
api_key = "${NONEXISTENT_VAR_12345}"

[fastqc]
path = "/opt/FastQC/fastqc"
timeout = 600

[workers]
default = 6

[search]
page_size = 20
max_catalog_retries = 2
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.output.clean_dir, PathBuf::from("/data/clean"));
        // unspecified fields keep defaults
        assert_eq!(config.output.scratch_dir, PathBuf::from("temp_gz_files"));
        assert_eq!(config.ncbi.email.as_deref(), Some("lab@example.org"));
        assert_eq!(config.ncbi.api_key, None);
        assert_eq!(config.workers.default, 6);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.page_size, 20);
        assert_eq!(pipeline.workers, 6);
        assert_eq!(pipeline.catalog_retry.max_attempts, 2);
        assert_eq!(pipeline.fastqc_path, PathBuf::from("/opt/FastQC/fastqc"));
        assert_eq!(pipeline.inspection_timeout, Duration::from_secs(600));
        assert_eq!(
            pipeline.event_log,
            Some(PathBuf::from("/data/events.jsonl"))
        );
    }

    #[test]
    fn user_agent_carries_contact() {
        let mut config = Config::default();
        config.ncbi.email = Some("me@lab.org".into());
        let agent = config.http_config().user_agent.unwrap();
        assert!(agent.starts_with("sraline/"));
        assert!(agent.ends_with("(contact: me@lab.org)"));
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sraline.toml");
        std::fs::write(&path, "[workers]\ndefault = \"many\"\n").unwrap();
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err}").contains("sraline.toml"));
    }
}
