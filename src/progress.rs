// src/progress.rs
//
// Transfer progress reporting. Indicators only observe byte counts; nothing
// they do (including panicking while rendering) may affect the transfer.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::IndicatorKind;
use crate::constants::DEFAULT_PROGRESS_LOG_INTERVAL;

pub trait ProgressIndicator: Send + Sync {
    /// Record `bytes` more transferred; called once per completed part.
    fn add(&self, bytes: u64);

    /// Final flush.
    fn finish(&self);
}

pub struct SilentIndicator;

impl ProgressIndicator for SilentIndicator {
    fn add(&self, _bytes: u64) {}

    fn finish(&self) {}
}

/// Logs a throughput line every `interval` calls to `add`.
pub struct LogIndicator {
    name: String,
    total: u64,
    interval: u64,
    calls: AtomicU64,
    bytes: AtomicU64,
    started: Instant,
}

impl LogIndicator {
    pub fn new(name: impl Into<String>, total: u64, interval: u64) -> Self {
        Self {
            name: name.into(),
            total,
            interval: interval.max(1),
            calls: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn report(&self, label: &str) {
        let bytes = self.bytes();
        let secs = self.started.elapsed().as_secs_f64().max(1e-6);
        let mib_per_sec = bytes as f64 / 1_048_576.0 / secs;
        if self.total > 0 {
            let pct = 100.0 * bytes as f64 / self.total as f64;
            info!("{} {}: {}/{} bytes ({:.1}%) {:.2} MiB/s", label, self.name, bytes, self.total, pct, mib_per_sec);
        } else {
            info!("{} {}: {} bytes {:.2} MiB/s", label, self.name, bytes, mib_per_sec);
        }
    }
}

impl ProgressIndicator for LogIndicator {
    fn add(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if calls % self.interval == 0 {
            self.report("progress");
        }
    }

    fn finish(&self) {
        self.report("finished");
    }
}

// One draw target for every bar in the process
fn multi() -> &'static MultiProgress {
    static MULTI: OnceLock<MultiProgress> = OnceLock::new();
    MULTI.get_or_init(MultiProgress::new)
}

/// indicatif bar on stderr; a spinner when the total is unknown.
pub struct BarIndicator {
    bar: ProgressBar,
}

impl BarIndicator {
    pub fn new(name: &str, total: u64) -> Self {
        let bar = if total > 0 {
            let bar = multi().add(ProgressBar::new(total));
            let template = format!(
                "{}: [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, ETA: {{eta}})",
                name
            );
            if let Ok(style) = ProgressStyle::default_bar().template(&template) {
                bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
            }
            bar
        } else {
            let bar = multi().add(ProgressBar::new_spinner());
            if let Ok(style) = ProgressStyle::default_spinner().template(&format!("{}: {{spinner:.green}} {{bytes}}", name)) {
                bar.set_style(style);
            }
            bar
        };
        Self { bar }
    }
}

impl ProgressIndicator for BarIndicator {
    fn add(&self, bytes: u64) {
        self.bar.inc(bytes);
    }

    fn finish(&self) {
        self.bar.finish();
    }
}

impl IndicatorKind {
    /// Build an indicator for a transfer named `name` of `total` bytes (0 if unknown).
    pub fn create(self, name: &str, total: u64) -> Box<dyn ProgressIndicator> {
        match self {
            IndicatorKind::Silent => Box::new(SilentIndicator),
            IndicatorKind::Log => Box::new(LogIndicator::new(name, total, DEFAULT_PROGRESS_LOG_INTERVAL)),
            IndicatorKind::Bar => Box::new(BarIndicator::new(name, total)),
            IndicatorKind::Auto if std::io::stderr().is_terminal() => Box::new(BarIndicator::new(name, total)),
            IndicatorKind::Auto => Box::new(LogIndicator::new(name, total, DEFAULT_PROGRESS_LOG_INTERVAL)),
        }
    }
}

/// Scoped indicator: `finish` runs exactly once, when the guard is dropped,
/// whether the transfer succeeded or not. A panicking indicator is disabled
/// instead of propagating.
pub struct ProgressGuard {
    indicator: Box<dyn ProgressIndicator>,
    broken: AtomicBool,
}

impl ProgressGuard {
    pub fn new(indicator: Box<dyn ProgressIndicator>) -> Self {
        Self {
            indicator,
            broken: AtomicBool::new(false),
        }
    }

    pub fn add(&self, bytes: u64) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| self.indicator.add(bytes))).is_err() {
            warn!("progress indicator failed; disabling it for the rest of the transfer");
            self.broken.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        if catch_unwind(AssertUnwindSafe(|| self.indicator.finish())).is_err() {
            warn!("progress indicator failed while finishing");
        }
    }
}
