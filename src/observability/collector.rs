use super::{WorkerMetrics, WorkerSnapshot};
use std::sync::Arc;

/// Registry of the metrics of every save worker in a pool
#[derive(Clone, Default)]
pub struct MetricsCollector {
    workers: Vec<Arc<WorkerMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metrics: Arc<WorkerMetrics>) {
        self.workers.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|m| m.snapshot()).collect()
    }

    pub fn frames_written(&self) -> u64 {
        self.workers.iter().map(|m| m.frames_written()).sum()
    }
}
