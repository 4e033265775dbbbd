// Performance metrics module
//
// Lightweight counters for the save-state pipeline, plus the engine-access
// instrumentation that backs the single-writer invariant.

use crate::models::MAX_CONCURRENT_ENGINE_OPERATIONS;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Session-wide performance metrics
///
/// Uses atomic operations so the queue worker, the capture loop and UI callers can
/// record without locks. Logged on shutdown by the session controller.
#[derive(Debug)]
pub struct Metrics {
    /// Operations accepted by the queue
    pub operations_enqueued: AtomicU64,

    /// Operations that ran to completion (success or failure)
    pub operations_completed: AtomicU64,

    /// Operations whose task panicked
    pub operations_failed: AtomicU64,

    /// Operations dropped before starting because the queue shut down
    pub operations_cancelled: AtomicU64,

    /// Manual and auto saves persisted
    pub saves_completed: AtomicU64,

    /// Saves that failed at capture or persistence
    pub saves_failed: AtomicU64,

    /// States loaded into the engine
    pub loads_completed: AtomicU64,

    /// Auto-save cycles that finished successfully
    pub auto_saves: AtomicU64,

    /// Rewind snapshots captured
    pub rewind_captures: AtomicU64,

    /// Capture ticks skipped because the queue was busy
    pub rewind_ticks_skipped: AtomicU64,

    /// Total time spent executing queued operations in milliseconds
    pub total_operation_time_ms: AtomicU64,

    /// Accessors currently holding the engine
    engine_in_flight: AtomicUsize,

    /// High-water mark of `engine_in_flight`
    max_engine_concurrency: AtomicUsize,

    start_time: Instant,
}

/// Marks one accessor as holding the engine until dropped.
#[must_use = "the access is only counted while the guard is alive"]
pub struct EngineAccess<'a> {
    metrics: &'a Metrics,
}

impl Drop for EngineAccess<'_> {
    fn drop(&mut self) {
        self.metrics.engine_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operations_enqueued: AtomicU64::new(0),
            operations_completed: AtomicU64::new(0),
            operations_failed: AtomicU64::new(0),
            operations_cancelled: AtomicU64::new(0),
            saves_completed: AtomicU64::new(0),
            saves_failed: AtomicU64::new(0),
            loads_completed: AtomicU64::new(0),
            auto_saves: AtomicU64::new(0),
            rewind_captures: AtomicU64::new(0),
            rewind_ticks_skipped: AtomicU64::new(0),
            total_operation_time_ms: AtomicU64::new(0),
            engine_in_flight: AtomicUsize::new(0),
            max_engine_concurrency: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_enqueued(&self) {
        self.operations_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, duration: Duration) {
        self.operations_completed.fetch_add(1, Ordering::Relaxed);
        self.total_operation_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.operations_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save(&self, success: bool) {
        if success {
            self.saves_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.saves_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_load(&self) {
        self.loads_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auto_save(&self) {
        self.auto_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewind_capture(&self) {
        self.rewind_captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewind_skip(&self) {
        self.rewind_ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an accessor entering the engine; the returned guard counts the exit.
    pub fn enter_engine(&self) -> EngineAccess<'_> {
        let now = self.engine_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_engine_concurrency.fetch_max(now, Ordering::SeqCst);
        EngineAccess { metrics: self }
    }

    /// Highest number of simultaneous engine accessors ever observed.
    pub fn max_engine_concurrency(&self) -> usize {
        self.max_engine_concurrency.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average execution time per completed operation in milliseconds
    pub fn avg_operation_time_ms(&self) -> f64 {
        let total = self.total_operation_time_ms.load(Ordering::Relaxed);
        let count = self.operations_completed.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Save-State Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Queue: {} enqueued, {} completed, {} panicked, {} cancelled (avg {:.2}ms)",
            self.operations_enqueued.load(Ordering::Relaxed),
            self.operations_completed.load(Ordering::Relaxed),
            self.operations_failed.load(Ordering::Relaxed),
            self.operations_cancelled.load(Ordering::Relaxed),
            self.avg_operation_time_ms()
        );
        tracing::info!(
            "Saves: {} ok, {} failed, {} auto; loads: {}",
            self.saves_completed.load(Ordering::Relaxed),
            self.saves_failed.load(Ordering::Relaxed),
            self.auto_saves.load(Ordering::Relaxed),
            self.loads_completed.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Rewind: {} captures, {} ticks skipped; max engine concurrency {}",
            self.rewind_captures.load(Ordering::Relaxed),
            self.rewind_ticks_skipped.load(Ordering::Relaxed),
            self.max_engine_concurrency()
        );

        if self.max_engine_concurrency() > MAX_CONCURRENT_ENGINE_OPERATIONS {
            tracing::error!(
                "Engine was accessed by {} operations at once (limit {})",
                self.max_engine_concurrency(),
                MAX_CONCURRENT_ENGINE_OPERATIONS
            );
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
