//! Failure taxonomy shared by the catalog and download stages

use std::time::Duration;

use crate::stream::StreamError;

/// Errors that may clear up on their own when the operation is repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StreamError {
    fn is_retryable(&self) -> bool {
        StreamError::is_retryable(self)
    }
}

/// Catalog search or resolve failed (`CatalogUnavailable`).
///
/// Either the request itself failed or the response could not be read.
#[derive(Debug)]
pub enum CatalogError {
    Stream(StreamError),
    Malformed(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "catalog unavailable: {e}"),
            Self::Malformed(msg) => write!(f, "catalog unavailable: malformed response: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<StreamError> for CatalogError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

/// Every catalog failure is retried on the same cursor until the retry
/// budget runs out, client errors included.
impl Retryable for CatalogError {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Error from downloading a single blob (`TransportFailure`).
#[derive(Debug)]
pub enum TransportError {
    Stream(StreamError),
    Io(std::io::Error),
    /// Fewer bytes arrived than the size probe announced
    Truncated { expected: u64, actual: u64 },
    /// Whole-download ceiling exceeded
    Deadline(Duration),
    Cancelled,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Truncated { expected, actual } => write!(
                f,
                "truncated: downloaded {actual} bytes, expected {expected}"
            ),
            Self::Deadline(limit) => {
                write!(f, "download exceeded {}s ceiling", limit.as_secs())
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<StreamError> for TransportError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Stream(e) => e.is_retryable(),
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
            Self::Truncated { .. } | Self::Deadline(_) => true,
            Self::Cancelled => false,
        }
    }
}
