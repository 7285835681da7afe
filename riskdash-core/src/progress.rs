//! Progress reporting for bulk runs and exports.
//!
//! The CLI uses `IndicatifReporter`; library callers and tests use
//! `NoopReporter` or their own implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Receives progress for one long-running task at a time.
pub trait ProgressReporter: Send + Sync {
    /// Begin a task with an optional total item count.
    fn start(&self, task: &str, total: Option<u64>);

    /// Advance by `amount` items.
    fn advance(&self, amount: u64);

    fn finish(&self);

    /// Print a line without disturbing the bar.
    fn message(&self, msg: &str);
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _task: &str, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Reporter backed by an `indicatif` progress bar on stderr.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    completed: AtomicU64,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    /// Bar drawn to stderr.
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// Bar that never draws (quiet mode, tests).
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        Self {
            bar: ProgressBar::with_draw_target(None, target),
            completed: AtomicU64::new(0),
        }
    }

    /// Items advanced since the last `start`.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, task: &str, total: Option<u64>) {
        self.completed.store(0, Ordering::Relaxed);
        let template = if let Some(total) = total {
            self.bar.set_length(total);
            "{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len} ({per_sec}, {eta})"
        } else {
            self.bar.set_length(0);
            "{spinner:.green} {msg} {pos} items"
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            self.bar.set_style(style.progress_chars("=> "));
        }
        self.bar.set_message(task.to_string());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.completed.fetch_add(amount, Ordering::Relaxed);
        self.bar.inc(amount);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }
}
