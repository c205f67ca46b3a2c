//! Bounded download pool
//!
//! Each page of descriptors is fanned out over a rayon pool of `W` threads.
//! Outcomes come back over an mpsc channel in completion order, so the
//! controller can start gating the first finished download while the rest of
//! the page is still streaming.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use sraline_core::progress::upgrade_to_bar;
use sraline_core::{
    CancelFlag, SharedProgress, StreamError, TransportError, open_body_reader,
    probe_content_length,
};

use crate::config::clamp_workers;
use crate::state::{DownloadOutcome, DownloadStatus, ItemDescriptor, is_safe_identifier};

/// Copy buffer; cancellation and the download ceiling are checked once per chunk
const CHUNK_SIZE: usize = 64 * 1024;

/// Where blob bytes come from
pub trait BlobTransport: Send + Sync {
    /// Expected size in bytes, if the server announces one
    fn probe_size(&self, locator: &str) -> Result<Option<u64>, StreamError>;

    /// Byte stream of the blob body
    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, StreamError>;
}

/// HEAD for the size, GET for the body, both on the shared client
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransport;

impl BlobTransport for HttpTransport {
    fn probe_size(&self, locator: &str) -> Result<Option<u64>, StreamError> {
        probe_content_length(locator)
    }

    fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, StreamError> {
        let (reader, _) = open_body_reader(locator)?;
        Ok(Box::new(reader))
    }
}

/// Everything a worker thread needs for one item, cloned per spawn
#[derive(Clone)]
struct FetchJob {
    transport: Arc<dyn BlobTransport>,
    scratch_dir: PathBuf,
    download_timeout: Duration,
    cancel: CancelFlag,
    progress: SharedProgress,
}

/// Download pool with exactly `workers` threads
pub struct FetchPool {
    pool: rayon::ThreadPool,
    workers: usize,
    job: FetchJob,
}

impl FetchPool {
    /// Build the pool and prepare `scratch_dir`.
    ///
    /// `workers` is clamped into `[1, 8]`. Stale `.tmp` files from an
    /// interrupted earlier run are removed.
    pub fn new(
        workers: usize,
        scratch_dir: &Path,
        transport: Arc<dyn BlobTransport>,
        cancel: CancelFlag,
        progress: SharedProgress,
    ) -> Result<Self> {
        let workers = clamp_workers(workers);

        fs::create_dir_all(scratch_dir).with_context(|| {
            format!("Failed to create scratch directory {}", scratch_dir.display())
        })?;
        cleanup_tmp_files(scratch_dir).context("Failed to clean scratch directory")?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("fetch-{i}"))
            .panic_handler(|_| log::error!("Download worker panicked; its item counts as failed"))
            .build()
            .context("Failed to create download pool")?;

        Ok(Self {
            pool,
            workers,
            job: FetchJob {
                transport,
                scratch_dir: scratch_dir.to_path_buf(),
                download_timeout: Duration::from_secs(4 * 60 * 60),
                cancel,
                progress,
            },
        })
    }

    /// Ceiling for one whole download
    pub fn with_download_timeout(mut self, limit: Duration) -> Self {
        self.job.download_timeout = limit;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start downloading every item; outcomes arrive in completion order.
    ///
    /// The receiver disconnects once every job has finished. A job that
    /// panics sends nothing, so callers compare the received count with
    /// the submitted count.
    pub fn submit_batch(&self, items: Vec<ItemDescriptor>) -> mpsc::Receiver<DownloadOutcome> {
        let (tx, rx) = mpsc::channel();
        for item in items {
            let tx = tx.clone();
            let job = self.job.clone();
            self.pool.spawn(move || {
                let outcome = job.download(&item);
                // Receiver gone means the controller stopped listening
                let _ = tx.send(outcome);
            });
        }
        rx
    }
}

impl FetchJob {
    fn download(&self, item: &ItemDescriptor) -> DownloadOutcome {
        if !is_safe_identifier(&item.identifier) {
            return DownloadOutcome {
                identifier: item.identifier.clone(),
                local_path: PathBuf::new(),
                status: DownloadStatus::Failed(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unusable run accession {:?}", item.identifier),
                ))),
            };
        }
        let local_path = self.scratch_dir.join(item.file_name());

        let status = if local_path.exists() {
            log::debug!("{}: already on scratch storage, skipping download", item.identifier);
            DownloadStatus::AlreadyPresent
        } else if self.cancel.is_cancelled() {
            DownloadStatus::Failed(TransportError::Cancelled)
        } else {
            let pb = self.progress.download_bar(&item.identifier);
            pb.set_message("probing size...");
            let result = fetch_blob(
                self.transport.as_ref(),
                &item.locator,
                &local_path,
                self.download_timeout,
                &self.cancel,
                &pb,
            );
            pb.finish_and_clear();

            match result {
                Ok(bytes) => DownloadStatus::Fetched { bytes },
                Err(e) => {
                    remove_if_present(&tmp_path(&local_path));
                    remove_if_present(&local_path);
                    DownloadStatus::Failed(e)
                }
            }
        };

        DownloadOutcome {
            identifier: item.identifier.clone(),
            local_path,
            status,
        }
    }
}

/// Stream one blob to `<dest>.tmp`, verify the byte count, then rename to `dest`.
///
/// A missing size announcement counts as an expected size of 0.
fn fetch_blob(
    transport: &dyn BlobTransport,
    locator: &str,
    dest: &Path,
    limit: Duration,
    cancel: &CancelFlag,
    pb: &ProgressBar,
) -> Result<u64, TransportError> {
    let started = Instant::now();

    let expected = transport.probe_size(locator)?.unwrap_or(0);
    if expected > 0 {
        upgrade_to_bar(pb, expected);
    }
    pb.set_message("downloading");

    let mut reader = transport.open(locator)?;
    let tmp = tmp_path(dest);
    let mut out = BufWriter::new(File::create(&tmp)?);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if started.elapsed() > limit {
            return Err(TransportError::Deadline(limit));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Stream(StreamError::Io(e))),
        };
        out.write_all(&buf[..n])?;
        written += n as u64;
        pb.set_position(written);
    }

    out.flush()?;
    drop(out);

    if written < expected {
        return Err(TransportError::Truncated {
            expected,
            actual: written,
        });
    }

    fs::rename(&tmp, dest)?;
    Ok(written)
}

/// `<path>.tmp`, the in-progress name of a download
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed partial download {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
    }
}

/// Remove stale `.tmp` files left in the scratch directory
pub fn cleanup_tmp_files(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale partial download: {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Mutex;
    use sraline_core::ProgressContext;

    /// Serves `body` for every locator and announces `declared` bytes
    struct FixedTransport {
        declared: Option<u64>,
        body: Vec<u8>,
        opened: Mutex<Vec<String>>,
    }

    impl FixedTransport {
        fn new(declared: Option<u64>, body: Vec<u8>) -> Self {
            Self {
                declared,
                body,
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    impl BlobTransport for FixedTransport {
        fn probe_size(&self, _locator: &str) -> Result<Option<u64>, StreamError> {
            Ok(self.declared)
        }

        fn open(&self, locator: &str) -> Result<Box<dyn Read + Send>, StreamError> {
            self.opened.lock().unwrap().push(locator.to_string());
            Ok(Box::new(Cursor::new(self.body.clone())))
        }
    }

    /// Announces 1 GiB and serves whatever `body` builds
    struct EndlessTransport<F>(F);

    impl<F> BlobTransport for EndlessTransport<F>
    where
        F: Fn() -> Box<dyn Read + Send> + Send + Sync,
    {
        fn probe_size(&self, _locator: &str) -> Result<Option<u64>, StreamError> {
            Ok(Some(1 << 30))
        }

        fn open(&self, _locator: &str) -> Result<Box<dyn Read + Send>, StreamError> {
            Ok((self.0)())
        }
    }

    /// Fills every read, cancelling the run on the first one
    struct CancellingReader(CancelFlag);

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.cancel();
            buf.fill(b'A');
            Ok(buf.len())
        }
    }

    /// One byte per `delay`, forever
    struct SlowReader(Duration);

    impl Read for SlowReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(self.0);
            buf[0] = b'A';
            Ok(1)
        }
    }

    fn assert_scratch_empty(dir: &Path) {
        let left: Vec<_> = fs::read_dir(dir).unwrap().collect();
        assert!(left.is_empty(), "scratch not empty: {left:?}");
    }

    fn item(id: &str) -> ItemDescriptor {
        ItemDescriptor {
            identifier: id.to_string(),
            locator: format!("mem://{id}"),
            declared_size: None,
            attributes: BTreeMap::new(),
        }
    }

    fn pool(dir: &Path, transport: Arc<dyn BlobTransport>, workers: usize) -> FetchPool {
        FetchPool::new(
            workers,
            dir,
            transport,
            CancelFlag::new(),
            Arc::new(ProgressContext::hidden()),
        )
        .unwrap()
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/s/SRR1.fastq.gz")),
            PathBuf::from("/s/SRR1.fastq.gz.tmp")
        );
    }

    #[test]
    fn worker_count_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport::new(None, vec![]));
        assert_eq!(pool(dir.path(), transport.clone(), 0).workers(), 1);
        assert_eq!(pool(dir.path(), transport, 32).workers(), 8);
    }

    #[test]
    fn downloads_every_item() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport::new(Some(4), b"ACGT".to_vec()));
        let pool = pool(dir.path(), transport, 3);

        let items: Vec<_> = (0..5).map(|i| item(&format!("SRR{i}"))).collect();
        let outcomes: Vec<_> = pool.submit_batch(items).iter().collect();

        assert_eq!(outcomes.len(), 5);
        for outcome in &outcomes {
            assert!(matches!(outcome.status, DownloadStatus::Fetched { bytes: 4 }));
            assert_eq!(fs::read(&outcome.local_path).unwrap(), b"ACGT");
        }
    }

    #[test]
    fn missing_size_counts_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport::new(None, b"xy".to_vec()));
        let outcome = pool(dir.path(), transport, 1)
            .submit_batch(vec![item("SRR9")])
            .recv()
            .unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn truncated_download_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport::new(Some(1000), vec![0u8; 500]));
        let outcome = pool(dir.path(), transport, 2)
            .submit_batch(vec![item("SRR7")])
            .recv()
            .unwrap();

        assert!(!outcome.is_success());
        assert!(matches!(
            outcome.status,
            DownloadStatus::Failed(TransportError::Truncated {
                expected: 1000,
                actual: 500
            })
        ));
        assert!(!outcome.local_path.exists());
        assert!(!tmp_path(&outcome.local_path).exists());
    }

    #[test]
    fn existing_blob_skips_transport() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SRR5.fastq.gz"), b"old").unwrap();
        let transport = Arc::new(FixedTransport::new(Some(3), b"new".to_vec()));
        let outcome = pool(dir.path(), transport.clone(), 2)
            .submit_batch(vec![item("SRR5")])
            .recv()
            .unwrap();

        assert!(matches!(outcome.status, DownloadStatus::AlreadyPresent));
        assert!(transport.opened.lock().unwrap().is_empty());
        assert_eq!(fs::read(&outcome.local_path).unwrap(), b"old");
    }

    #[test]
    fn path_like_identifier_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let transport = Arc::new(FixedTransport::new(Some(3), b"abc".to_vec()));
        let outcome = pool(&scratch, transport.clone(), 1)
            .submit_batch(vec![item("../escape")])
            .recv()
            .unwrap();

        assert!(matches!(
            &outcome.status,
            DownloadStatus::Failed(TransportError::Io(e)) if e.kind() == io::ErrorKind::InvalidInput
        ));
        assert!(transport.opened.lock().unwrap().is_empty());
        assert!(!dir.path().join("escape.fastq.gz").exists());
    }

    #[test]
    fn cancelled_pool_fetches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(FixedTransport::new(Some(3), b"abc".to_vec()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let pool = FetchPool::new(
            2,
            dir.path(),
            transport.clone(),
            cancel,
            Arc::new(ProgressContext::hidden()),
        )
        .unwrap();

        let outcomes: Vec<_> = pool.submit_batch(vec![item("SRR1"), item("SRR2")]).iter().collect();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.is_success()));
        assert!(transport.opened.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_mid_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let transport = Arc::new(EndlessTransport(move || {
            Box::new(CancellingReader(flag.clone())) as Box<dyn Read + Send>
        }));
        let pool = FetchPool::new(
            1,
            dir.path(),
            transport,
            cancel,
            Arc::new(ProgressContext::hidden()),
        )
        .unwrap();

        let outcome = pool.submit_batch(vec![item("SRR3")]).recv().unwrap();

        assert!(matches!(
            outcome.status,
            DownloadStatus::Failed(TransportError::Cancelled)
        ));
        assert!(!outcome.local_path.exists());
        assert!(!tmp_path(&outcome.local_path).exists());
        assert_scratch_empty(dir.path());
    }

    #[test]
    fn download_ceiling_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(EndlessTransport(|| {
            Box::new(SlowReader(Duration::from_millis(10))) as Box<dyn Read + Send>
        }));
        let pool = pool(dir.path(), transport, 1).with_download_timeout(Duration::from_millis(50));

        let outcome = pool.submit_batch(vec![item("SRR4")]).recv().unwrap();

        assert!(matches!(
            outcome.status,
            DownloadStatus::Failed(TransportError::Deadline(limit)) if limit == Duration::from_millis(50)
        ));
        assert!(!tmp_path(&outcome.local_path).exists());
        assert_scratch_empty(dir.path());
    }

    #[test]
    fn stale_tmp_files_removed_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("SRR1.fastq.gz.tmp"), b"partial").unwrap();
        fs::write(dir.path().join("SRR2.fastq.gz"), b"kept").unwrap();
        let _pool = pool(dir.path(), Arc::new(FixedTransport::new(None, vec![])), 1);
        assert!(!dir.path().join("SRR1.fastq.gz.tmp").exists());
        assert!(dir.path().join("SRR2.fastq.gz").exists());
    }
}
