//! HTTP access with connect, request and read-stall timeouts.
//!
//! Uses async reqwest internally with tokio::time::timeout for every network
//! wait, but presents a sync interface so rayon download workers and the
//! controller thread can call it directly.

use std::io::{self, Read};
use std::pin::Pin;
use std::sync::{LazyLock, OnceLock};
use std::task::Context;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};

/// Network timeouts and identification shared by every request.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Ceiling for small request/response exchanges (catalog calls, size probes)
    pub request_timeout: Duration,
    /// Stall detection: no body bytes for this long = failure
    pub read_timeout: Duration,
    /// Sent as `User-Agent`; NCBI asks clients to include a contact address
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

static HTTP_CONFIG: OnceLock<HttpConfig> = OnceLock::new();

/// Install the process-wide HTTP settings.
///
/// Must run before the first request; returns `false` if settings were
/// already fixed (either set earlier or defaulted by a request).
pub fn set_http_config(config: HttpConfig) -> bool {
    HTTP_CONFIG.set(config).is_ok()
}

/// Current HTTP settings (defaults if never set).
pub fn http_config() -> &'static HttpConfig {
    HTTP_CONFIG.get_or_init(HttpConfig::default)
}

/// Error types for stream operations
#[derive(Debug)]
pub enum StreamError {
    /// HTTP error with optional status code
    Http {
        status: Option<u16>,
        message: String,
    },
    /// I/O error (includes timeouts as `ErrorKind::TimedOut`)
    Io(std::io::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Http {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl StreamError {
    /// Create HTTP error from reqwest error
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Http {
            status: e.status().map(|s| s.as_u16()),
            message: describe(e),
        }
    }

    /// Timeout while waiting for `what`
    pub fn timeout(what: &str, after: Duration) -> Self {
        Self::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out after {}s", after.as_secs()),
        ))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            // Client errors other than throttling won't fix themselves
            Self::Http {
                status: Some(s), ..
            } => *s == 429 || !(400..500).contains(s),
            Self::Http { status: None, .. } => true,
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::TimedOut)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Render a reqwest error without its URL, which may carry an `api_key` query parameter
fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "timed out".to_string()
    } else if e.is_connect() {
        "connection failed".to_string()
    } else if let Some(status) = e.status() {
        status.canonical_reason().unwrap_or("bad status").to_string()
    } else if e.is_body() || e.is_decode() {
        "response body error".to_string()
    } else {
        "request failed".to_string()
    }
}

/// Shared async HTTP client with connection pooling.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    let config = http_config();
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .pool_max_idle_per_host(8);
    if let Some(agent) = &config.user_agent {
        builder = builder.user_agent(agent.clone());
    }
    builder.build().expect("failed to build HTTP client")
});

/// Shared tokio runtime for HTTP operations and inspector processes.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// GET `url` and return the body as text, bounded by the request timeout.
pub fn get_text(url: &str) -> Result<String, StreamError> {
    let limit = http_config().request_timeout;
    SHARED_RUNTIME.handle().block_on(async {
        let exchange = async {
            let response = SHARED_CLIENT
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| StreamError::from_reqwest(&e))?;
            response
                .text()
                .await
                .map_err(|e| StreamError::from_reqwest(&e))
        };
        match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::timeout("request", limit)),
        }
    })
}

/// HEAD `url` and report the declared `Content-Length`, if any.
pub fn probe_content_length(url: &str) -> Result<Option<u64>, StreamError> {
    let limit = http_config().request_timeout;
    SHARED_RUNTIME.handle().block_on(async {
        let probe = async {
            let response = SHARED_CLIENT
                .head(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| StreamError::from_reqwest(&e))?;
            Ok::<_, StreamError>(content_length(response.headers()))
        };
        match tokio::time::timeout(limit, probe).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::timeout("size probe", limit)),
        }
    })
}

/// HTTP GET → sync reader over the body with stall detection.
///
/// Returns (reader, total_bytes)
pub fn open_body_reader(url: &str) -> Result<(TimeoutReader, Option<u64>), StreamError> {
    let limit = http_config().request_timeout;
    SHARED_RUNTIME.handle().block_on(async {
        let connect = async {
            SHARED_CLIENT
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| StreamError::from_reqwest(&e))
        };
        let response = match tokio::time::timeout(limit, connect).await {
            Ok(result) => result?,
            Err(_) => return Err(StreamError::timeout("response headers", limit)),
        };

        let total_bytes = content_length(response.headers());

        // Convert response body stream to AsyncRead
        let stream = response.bytes_stream();
        let async_reader = tokio_util::io::StreamReader::new(
            stream.map(|result| result.map_err(io::Error::other)),
        );

        Ok::<_, StreamError>((TimeoutReader::new(Box::pin(async_reader)), total_bytes))
    })
}

fn content_length(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

/// Async-to-sync bridge with read timeout.
///
/// Wraps an async reader and provides sync Read interface.
/// Each read operation has a timeout - if no data arrives within
/// the configured read timeout, returns a TimedOut error.
pub struct TimeoutReader {
    inner: Pin<Box<dyn AsyncRead + Send + Sync>>,
    limit: Duration,
}

impl TimeoutReader {
    fn new(inner: Pin<Box<dyn AsyncRead + Send + Sync>>) -> Self {
        Self {
            inner,
            limit: http_config().read_timeout,
        }
    }
}

impl Read for TimeoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = self.limit;
        SHARED_RUNTIME.handle().block_on(async {
            let read_future = async {
                let mut read_buf = ReadBuf::new(buf);
                std::future::poll_fn(|cx: &mut Context<'_>| {
                    Pin::as_mut(&mut self.inner).poll_read(cx, &mut read_buf)
                })
                .await?;
                Ok::<_, io::Error>(read_buf.filled().len())
            };

            match tokio::time::timeout(limit, read_future).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("read stalled ({}s with no data)", limit.as_secs()),
                )),
            }
        })
    }
}
