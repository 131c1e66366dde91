use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters of one save worker.
///
/// Written only by the owning worker; the coordinator reads them when it
/// builds the final report, including for workers it had to detach.
pub struct WorkerMetrics {
    worker: usize,
    frames_written: AtomicU64,
    write_failures: AtomicU64,
    retries: AtomicU64,
    skipped: AtomicU64,
    total_write_us: AtomicU64,
    write_samples: AtomicU64,
}

impl WorkerMetrics {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            frames_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            total_write_us: AtomicU64::new(0),
            write_samples: AtomicU64::new(0),
        }
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    pub fn record_written(&self) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Frame acknowledged without a write attempt
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn start_write(&self) -> Instant {
        Instant::now()
    }

    pub fn finish_write(&self, start: Instant) {
        let latency_us = start.elapsed().as_micros() as u64;
        self.total_write_us.fetch_add(latency_us, Ordering::Relaxed);
        self.write_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_write_us(&self) -> u64 {
        let samples = self.write_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.total_write_us.load(Ordering::Relaxed) / samples
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker: self.worker,
            frames_written: self.frames_written(),
            write_failures: self.write_failures(),
            retries: self.retries.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            avg_write_us: self.avg_write_us(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub worker: usize,
    pub frames_written: u64,
    pub write_failures: u64,
    pub retries: u64,
    pub skipped: u64,
    pub avg_write_us: u64,
}
