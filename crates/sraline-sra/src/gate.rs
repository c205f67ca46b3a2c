//! Quality gate: run the inspector, read its summary, promote or reject.
//!
//! Runs on the controller thread, one inspection at a time. Whatever the
//! verdict, the per-item inspector directory and the downloaded blob are
//! removed before [`QualityGate::inspect`] returns.

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sraline_core::SHARED_RUNTIME;

use crate::state::{QualityVerdict, VerdictKind, is_safe_identifier};

/// Why an inspection produced no usable verdict (`GateInfrastructureFailure`)
#[derive(Debug)]
pub enum GateError {
    /// Inspector executable could not be started
    Spawn(io::Error),
    Timeout(Duration),
    Io(io::Error),
    /// Inspector finished but its summary report is absent
    MissingReport(PathBuf),
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to start inspector: {e}"),
            Self::Timeout(limit) => write!(f, "inspector killed after {}s", limit.as_secs()),
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::MissingReport(path) => write!(f, "no summary report at {}", path.display()),
        }
    }
}

impl std::error::Error for GateError {}

impl From<io::Error> for GateError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// External quality inspection tool
pub trait Inspector: Send + Sync {
    /// Short name for logs and events
    fn name(&self) -> &str;

    /// Inspect `input`, writing results under `out_dir`, within `timeout`.
    fn run(&self, input: &Path, out_dir: &Path, timeout: Duration) -> Result<(), GateError>;

    /// Where `run` leaves its plain-text summary
    fn report_path(&self, input: &Path, out_dir: &Path) -> PathBuf;
}

/// FastQC, invoked as `fastqc <input> -o <out_dir> --extract`
#[derive(Debug, Clone)]
pub struct FastqcInspector {
    program: PathBuf,
}

impl FastqcInspector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Inspector for FastqcInspector {
    fn name(&self) -> &str {
        "FastQC"
    }

    fn run(&self, input: &Path, out_dir: &Path, timeout: Duration) -> Result<(), GateError> {
        SHARED_RUNTIME.block_on(async {
            let child = tokio::process::Command::new(&self.program)
                .arg(input)
                .arg("-o")
                .arg(out_dir)
                .arg("--extract")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(GateError::Spawn)?;

            // Dropping the future on timeout kills the child
            let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result?,
                Err(_) => return Err(GateError::Timeout(timeout)),
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                log::warn!(
                    "fastqc exited with {} for {}: {}",
                    output.status,
                    input.display(),
                    stderr.lines().next_back().unwrap_or("").trim()
                );
            }
            Ok::<_, GateError>(())
        })
    }

    fn report_path(&self, input: &Path, out_dir: &Path) -> PathBuf {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        out_dir
            .join(format!("{}_fastqc", report_stem(&name)))
            .join("summary.txt")
    }
}

/// File name without its read-file suffix, the way FastQC names its output
fn report_stem(name: &str) -> &str {
    [".fastq.gz", ".fq.gz", ".fastq", ".fq", ".gz"]
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

/// First failing check in a summary report, trimmed.
///
/// Lines look like `FAIL<TAB>Per base sequence quality<TAB>SRR1.fastq.gz`.
/// Free-form lines without tabs fall back to a substring match.
pub fn parse_summary(text: &str) -> Option<String> {
    text.lines()
        .find(|line| match line.split_once('\t') {
            Some((status, _)) => status.trim() == "FAIL",
            None => line.contains("FAIL"),
        })
        .map(|line| line.trim().to_string())
}

/// Removes the inspector scratch dir and the downloaded blob on drop
struct Cleanup<'a> {
    scratch: &'a Path,
    blob: &'a Path,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(self.scratch) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {e}", self.scratch.display());
            }
        }
        if let Err(e) = fs::remove_file(self.blob) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("Failed to remove {}: {e}", self.blob.display());
            }
        }
    }
}

/// Serialized inspector front-end
pub struct QualityGate {
    inspector: Arc<dyn Inspector>,
    inspect_root: PathBuf,
    clean_dir: PathBuf,
    timeout: Duration,
}

impl QualityGate {
    pub fn new(inspector: Arc<dyn Inspector>, inspect_root: &Path, clean_dir: &Path) -> Self {
        Self {
            inspector,
            inspect_root: inspect_root.to_path_buf(),
            clean_dir: clean_dir.to_path_buf(),
            timeout: Duration::from_secs(2 * 60 * 60),
        }
    }

    /// Ceiling for one inspector run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn inspector_name(&self) -> &str {
        self.inspector.name()
    }

    /// Inspect `blob` and decide. Never fails; problems become a
    /// [`VerdictKind::GateFailure`] verdict.
    pub fn inspect(&self, identifier: &str, blob: &Path) -> QualityVerdict {
        if !is_safe_identifier(identifier) {
            // Touch nothing: the identifier would address paths outside inspect_root
            return QualityVerdict {
                identifier: identifier.to_string(),
                kind: VerdictKind::GateFailure,
                diagnostic: format!("unusable run accession {identifier:?}"),
            };
        }
        let scratch = self.inspect_root.join(identifier);
        let _cleanup = Cleanup {
            scratch: &scratch,
            blob,
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(blob, &scratch)));
        let (kind, diagnostic) = match result {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => (VerdictKind::GateFailure, e.to_string()),
            Err(_) => (
                VerdictKind::GateFailure,
                format!("{} panicked", self.inspector.name()),
            ),
        };

        QualityVerdict {
            identifier: identifier.to_string(),
            kind,
            diagnostic,
        }
    }

    fn evaluate(&self, blob: &Path, scratch: &Path) -> Result<(VerdictKind, String), GateError> {
        fs::create_dir_all(scratch)?;
        self.inspector.run(blob, scratch, self.timeout)?;

        let report = self.inspector.report_path(blob, scratch);
        let text = match fs::read_to_string(&report) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(GateError::MissingReport(report));
            }
            Err(e) => return Err(GateError::Io(e)),
        };

        if let Some(line) = parse_summary(&text) {
            return Ok((VerdictKind::QualityRejected, line));
        }

        let dest = promote(blob, &self.clean_dir)?;
        Ok((VerdictKind::Passed, format!("saved to {}", dest.display())))
    }
}

/// Copy `blob` into `clean_dir` via `<name>.tmp` and rename.
fn promote(blob: &Path, clean_dir: &Path) -> Result<PathBuf, GateError> {
    let name = blob.file_name().ok_or_else(|| {
        GateError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", blob.display()),
        ))
    })?;
    fs::create_dir_all(clean_dir)?;

    let dest = clean_dir.join(name);
    let tmp = clean_dir.join(format!("{}.tmp", name.to_string_lossy()));
    let copied = fs::copy(blob, &tmp).and_then(|_| fs::rename(&tmp, &dest));
    if let Err(e) = copied {
        let _ = fs::remove_file(&tmp);
        return Err(GateError::Io(e));
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a canned report (or none) into the FastQC layout
    struct CannedInspector {
        report: Option<&'static str>,
    }

    impl Inspector for CannedInspector {
        fn name(&self) -> &str {
            "canned"
        }

        fn run(&self, input: &Path, out_dir: &Path, _timeout: Duration) -> Result<(), GateError> {
            if let Some(report) = self.report {
                let path = self.report_path(input, out_dir);
                fs::create_dir_all(path.parent().unwrap())?;
                fs::write(path, report)?;
            }
            Ok(())
        }

        fn report_path(&self, input: &Path, out_dir: &Path) -> PathBuf {
            FastqcInspector::new("fastqc").report_path(input, out_dir)
        }
    }

    struct PanickingInspector;

    impl Inspector for PanickingInspector {
        fn name(&self) -> &str {
            "boom"
        }

        fn run(&self, _: &Path, _: &Path, _: Duration) -> Result<(), GateError> {
            panic!("inspector bug")
        }

        fn report_path(&self, _: &Path, out_dir: &Path) -> PathBuf {
            out_dir.join("summary.txt")
        }
    }

    const PASSING: &str = "PASS\tBasic Statistics\tSRR1.fastq.gz\n\
                           WARN\tPer base sequence content\tSRR1.fastq.gz\n\
                           PASS\tAdapter Content\tSRR1.fastq.gz\n";

    const FAILING: &str = "PASS\tBasic Statistics\tSRR1.fastq.gz\n\
                           FAIL\tPer base sequence quality\tSRR1.fastq.gz\n\
                           FAIL\tOverrepresented sequences\tSRR1.fastq.gz\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        scratch: PathBuf,
        inspect: PathBuf,
        clean: PathBuf,
        blob: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let blob = scratch.join("SRR1.fastq.gz");
        fs::write(&blob, b"@r1\nACGT\n+\nIIII\n").unwrap();
        Fixture {
            inspect: dir.path().join("inspect"),
            clean: dir.path().join("clean"),
            scratch,
            blob,
            _dir: dir,
        }
    }

    fn gate(inspector: impl Inspector + 'static, fx: &Fixture) -> QualityGate {
        QualityGate::new(Arc::new(inspector), &fx.inspect, &fx.clean)
    }

    #[test]
    fn summary_first_fail_line() {
        assert_eq!(
            parse_summary(FAILING).as_deref(),
            Some("FAIL\tPer base sequence quality\tSRR1.fastq.gz")
        );
        assert_eq!(parse_summary(PASSING), None);
        assert_eq!(parse_summary(""), None);
    }

    #[test]
    fn summary_status_column_only() {
        // a module name mentioning FAIL in a later column is not a failure
        assert_eq!(parse_summary("PASS\tFAILSAFE check\tx.fastq.gz\n"), None);
        assert_eq!(
            parse_summary("  overall: FAIL  \n").as_deref(),
            Some("overall: FAIL")
        );
    }

    #[test]
    fn report_stem_strips_read_suffixes() {
        assert_eq!(report_stem("SRR1.fastq.gz"), "SRR1");
        assert_eq!(report_stem("SRR1.fq.gz"), "SRR1");
        assert_eq!(report_stem("SRR1.fastq"), "SRR1");
        assert_eq!(report_stem("reads.bam"), "reads.bam");
        assert_eq!(
            FastqcInspector::new("fastqc").report_path(Path::new("/x/SRR9.fastq.gz"), Path::new("/o")),
            PathBuf::from("/o/SRR9_fastqc/summary.txt")
        );
    }

    #[test]
    fn passing_blob_is_promoted_and_cleaned() {
        let fx = fixture();
        let verdict = gate(CannedInspector { report: Some(PASSING) }, &fx).inspect("SRR1", &fx.blob);

        assert_eq!(verdict.kind, VerdictKind::Passed);
        assert!(verdict.accepted());
        let promoted = fx.clean.join("SRR1.fastq.gz");
        assert_eq!(fs::read(&promoted).unwrap(), b"@r1\nACGT\n+\nIIII\n");
        assert!(!fx.clean.join("SRR1.fastq.gz.tmp").exists());
        assert!(!fx.blob.exists());
        assert!(!fx.inspect.join("SRR1").exists());
    }

    #[test]
    fn failing_blob_is_rejected_and_cleaned() {
        let fx = fixture();
        let verdict = gate(CannedInspector { report: Some(FAILING) }, &fx).inspect("SRR1", &fx.blob);

        assert_eq!(verdict.kind, VerdictKind::QualityRejected);
        assert!(verdict.diagnostic.contains("Per base sequence quality"));
        assert!(!fx.clean.join("SRR1.fastq.gz").exists());
        assert!(!fx.blob.exists());
        assert!(!fx.inspect.join("SRR1").exists());
    }

    #[test]
    fn missing_report_is_gate_failure() {
        let fx = fixture();
        let verdict = gate(CannedInspector { report: None }, &fx).inspect("SRR1", &fx.blob);

        assert_eq!(verdict.kind, VerdictKind::GateFailure);
        assert!(verdict.diagnostic.contains("no summary report"));
        assert!(!fx.blob.exists());
        assert!(!fx.inspect.join("SRR1").exists());
        assert_eq!(fs::read_dir(&fx.scratch).unwrap().count(), 0);
    }

    #[test]
    fn missing_executable_is_gate_failure() {
        let fx = fixture();
        let inspector = FastqcInspector::new(fx.inspect.join("no-such-fastqc"));
        let verdict = gate(inspector, &fx).inspect("SRR1", &fx.blob);

        assert_eq!(verdict.kind, VerdictKind::GateFailure);
        assert!(verdict.diagnostic.starts_with("failed to start inspector"));
        assert!(!fx.blob.exists());
    }

    #[test]
    fn parent_dir_identifier_leaves_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let clean = work.join("clean_datasets");
        fs::create_dir_all(&clean).unwrap();
        fs::write(clean.join("SRR_prev.fastq.gz"), b"accepted earlier").unwrap();
        let blob = work.join("SRR1.fastq.gz");
        fs::write(&blob, b"@r1\n").unwrap();

        let gate = QualityGate::new(
            Arc::new(CannedInspector { report: Some(PASSING) }),
            &work.join("fastqc_temp"),
            &clean,
        );
        for id in ["..", "../clean_datasets", "x/.."] {
            let verdict = gate.inspect(id, &blob);
            assert_eq!(verdict.kind, VerdictKind::GateFailure, "{id}");
            assert!(verdict.diagnostic.contains("unusable run accession"));
        }
        assert_eq!(
            fs::read(clean.join("SRR_prev.fastq.gz")).unwrap(),
            b"accepted earlier"
        );
        assert!(clean.exists());
    }

    /// Blob that `sh` runs as a script, so `FastqcInspector::new("sh")` executes it
    #[cfg(unix)]
    fn script_blob(fx: &Fixture, script: &str) -> PathBuf {
        let blob = fx.scratch.join("SRR2.fastq.gz");
        fs::write(&blob, script).unwrap();
        blob
    }

    #[cfg(unix)]
    #[test]
    fn hung_inspector_is_killed() {
        let fx = fixture();
        let blob = script_blob(&fx, "sleep 30\n");
        let gate = gate(FastqcInspector::new("sh"), &fx).with_timeout(Duration::from_millis(300));

        let started = std::time::Instant::now();
        let verdict = gate.inspect("SRR2", &blob);

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(verdict.kind, VerdictKind::GateFailure);
        assert!(verdict.diagnostic.starts_with("inspector killed after"), "{}", verdict.diagnostic);
        assert!(!blob.exists());
        assert!(!fx.inspect.join("SRR2").exists());
        assert!(!fx.clean.join("SRR2.fastq.gz").exists());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_after_start_is_not_a_spawn_error() {
        let fx = fixture();
        let blob = script_blob(&fx, "exit 3\n");
        let verdict = gate(FastqcInspector::new("sh"), &fx).inspect("SRR2", &blob);

        assert_eq!(verdict.kind, VerdictKind::GateFailure);
        assert!(verdict.diagnostic.starts_with("no summary report"), "{}", verdict.diagnostic);
        assert!(!blob.exists());
    }

    #[test]
    fn panicking_inspector_is_contained() {
        let fx = fixture();
        let verdict = gate(PanickingInspector, &fx).inspect("SRR1", &fx.blob);

        assert_eq!(verdict.kind, VerdictKind::GateFailure);
        assert_eq!(verdict.diagnostic, "boom panicked");
        assert!(!fx.blob.exists());
        assert!(!fx.inspect.join("SRR1").exists());
    }
}
