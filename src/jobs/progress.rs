//! Progress tracking for long-running jobs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counts processed items against an optional total.
///
/// Shared by reference from the job context, so every counter is atomic.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: AtomicU64,
    current: AtomicU64,
    message: Mutex<Option<String>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking `total` items (0 = unknown).
    pub fn start(&self, total: u64, message: impl Into<String>) {
        let message = message.into();
        self.total.store(total, Ordering::Relaxed);
        self.current.store(0, Ordering::Relaxed);
        if !message.is_empty() {
            info!("{} ({} items)", message, total);
        }
        if let Ok(mut slot) = self.message.lock() {
            *slot = Some(message);
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, n: u64) {
        self.current.store(n, Ordering::Relaxed);
    }

    /// Mark the work done; a known total snaps the counter to it.
    pub fn finish(&self) {
        let total = self.total.load(Ordering::Relaxed);
        if total > 0 {
            self.current.store(total, Ordering::Relaxed);
        }

        let message = self.message.lock().ok().and_then(|mut slot| slot.take());
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            info!("{}: done ({} items)", message, self.current());
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Completion in percent rounded to two decimals, 0 while the total is unknown.
    pub fn percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let ratio = self.current().min(total) as f64 / total as f64;
        (ratio * 10_000.0).round() / 100.0
    }
}
