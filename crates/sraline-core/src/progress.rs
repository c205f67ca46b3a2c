//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: one byte bar per in-flight download plus a controller stage line.
//! Non-TTY mode: every bar is hidden and the log is the only progress output.

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Longest label shown in front of a download bar
const PREFIX_WIDTH: usize = 16;

/// Download byte bar (green bar, binary bytes, throughput)
fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<16.dim} {bar:30.green/dim} {binary_bytes:>9}/{binary_total_bytes:9} {binary_bytes_per_sec:>11} {wide_msg:.dim}")
        .expect("invalid template")
        .progress_chars("--")
}

/// Pending style, shown until the size probe answers
fn pending_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<16.dim} {wide_msg:.dim}")
        .expect("invalid template")
}

/// Upgrade a download bar from pending to bytes bar once the size is known.
pub fn upgrade_to_bar(pb: &ProgressBar, total: u64) {
    pb.set_length(total);
    pb.set_style(bar_style());
}

/// Central progress context managing multi-progress bars.
pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        Self::with_tty(std::io::stderr().is_terminal())
    }

    /// Context that never draws anything (tests, piped output).
    pub fn hidden() -> Self {
        Self::with_tty(false)
    }

    fn with_tty(is_tty: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty,
        }
    }

    /// Create a per-download bar labelled with the run accession.
    ///
    /// Starts in pending style; call [`upgrade_to_bar`] once the size probe
    /// returns. Hidden (no-op) outside a TTY.
    pub fn download_bar(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }

        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(pending_style());
        let display: String = name.chars().take(PREFIX_WIDTH).collect();
        pb.set_prefix(display);
        pb
    }

    /// Create a stage status line managed by MultiProgress.
    ///
    /// Returns a spinner; update with `pb.set_message(...)` as the stage
    /// progresses and call `pb.finish_and_clear()` when done.
    pub fn stage_line(&self, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} {prefix:<10.cyan.bold} {wide_msg}")
                .expect("invalid template"),
        );
        pb.set_prefix(name.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        pb
    }

    /// Whether running in TTY mode.
    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Get reference to `MultiProgress` for log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for `ProgressContext`.
pub type SharedProgress = Arc<ProgressContext>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_context_hands_out_hidden_bars() {
        let ctx = ProgressContext::hidden();
        assert!(!ctx.is_tty());
        assert!(ctx.download_bar("SRR32410640").is_hidden());
        assert!(ctx.stage_line("acquire").is_hidden());
    }

    #[test]
    fn upgrade_sets_length() {
        let pb = ProgressBar::hidden();
        upgrade_to_bar(&pb, 1000);
        assert_eq!(pb.length(), Some(1000));
    }
}
