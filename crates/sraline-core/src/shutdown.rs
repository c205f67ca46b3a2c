//! Cooperative cancellation via a shared atomic flag

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag, set by the SIGTERM/SIGINT handler.
///
/// A plain static so the handler only ever touches an atomic.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Cancellation flag shared between the controller and download workers.
///
/// Cloning is cheap; all clones observe the same flag. Nothing is interrupted
/// forcibly: workers poll [`is_cancelled`](CancelFlag::is_cancelled) between
/// chunks and the controller polls it between pages.
#[derive(Clone, Debug)]
pub struct CancelFlag(Flag);

#[derive(Clone, Debug)]
enum Flag {
    Owned(Arc<AtomicBool>),
    Global(&'static AtomicBool),
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self(Flag::Owned(Arc::default()))
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn atomic(&self) -> &AtomicBool {
        match &self.0 {
            Flag::Owned(flag) => flag.as_ref(),
            Flag::Global(flag) => *flag,
        }
    }

    /// Set the flag. Returns `true` if it was already set.
    pub fn cancel(&self) -> bool {
        self.atomic().swap(true, Ordering::Relaxed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.atomic().load(Ordering::Relaxed)
    }
}

/// Handle on the process-wide flag
pub fn shutdown_flag() -> CancelFlag {
    CancelFlag(Flag::Global(&SHUTDOWN))
}

/// Request shutdown (for signal handlers). Returns `true` if already requested.
pub fn request_shutdown() -> bool {
    SHUTDOWN.swap(true, Ordering::Relaxed)
}
