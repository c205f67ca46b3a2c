//! Sraline Core - Common infrastructure for dataset acquisition pipelines
//!
//! This crate provides the reusable pieces underneath a source-specific
//! pipeline: HTTP access with mandatory timeouts, retry/backoff, cooperative
//! cancellation, logging, progress bars and the structured event stream.

pub mod error;
pub mod events;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod shutdown;
pub mod stream;

// Re-exports for convenience
pub use error::{CatalogError, Retryable, TransportError};
pub use events::{Counters, Event, EventEmitter, EventKind, ProgressSnapshot, read_event_log};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use shutdown::{CancelFlag, request_shutdown, shutdown_flag};
pub use stream::{
    HttpConfig, SHARED_RUNTIME, StreamError, TimeoutReader, get_text, http_config,
    open_body_reader, probe_content_length, set_http_config,
};
