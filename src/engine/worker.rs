use crate::engine::channel::{Delivery, FrameReceiver, Outcome};
use crate::error::FrameFailure;
use crate::observability::{MetricsCollector, WorkerMetrics};
use crate::resilience::RetryPolicy;
use crate::storage::{FrameSink, PathLayout};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// One save worker: dequeue, resolve the path, write, acknowledge.
///
/// Runs on a blocking thread so a slow disk never holds up the async runtime
/// or a capture source beyond the channel's backpressure.
pub struct SaveWorker {
    id: usize,
    frames: FrameReceiver,
    layout: Arc<PathLayout>,
    sink: Arc<dyn FrameSink>,
    retry: RetryPolicy,
    metrics: Arc<WorkerMetrics>,
}

impl SaveWorker {
    pub fn new(
        id: usize,
        frames: FrameReceiver,
        layout: Arc<PathLayout>,
        sink: Arc<dyn FrameSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id,
            frames,
            layout,
            sink,
            retry,
            metrics: Arc::new(WorkerMetrics::new(id)),
        }
    }

    pub fn metrics(&self) -> Arc<WorkerMetrics> {
        self.metrics.clone()
    }

    /// Loop until the channel is closed and empty, or aborted.
    ///
    /// Returns the number of frames this worker acknowledged.
    pub fn run(self) -> u64 {
        debug!(worker = self.id, "save worker started");
        let mut handled = 0;
        while let Some(delivery) = self.frames.recv() {
            self.handle(delivery);
            handled += 1;
        }
        debug!(worker = self.id, handled, "save worker exiting");
        handled
    }

    fn handle(&self, delivery: Delivery) {
        let camera = delivery.frame().camera_id().clone();
        let frame_id = delivery.frame().frame_id();

        let path = match self.layout.resolve(&camera, frame_id) {
            Ok(path) => path,
            Err(failure) => {
                warn!(worker = self.id, camera = %camera, frame_id, error = %failure, "frame not saved");
                self.metrics.record_skipped();
                delivery.ack(Outcome::from(&failure));
                return;
            }
        };

        if !delivery.wait_turn() {
            debug!(worker = self.id, camera = %camera, frame_id, "channel aborted, frame abandoned");
            self.metrics.record_skipped();
            delivery.ack(Outcome::Abandoned);
            return;
        }

        match self.persist(&path, delivery.frame().payload()) {
            Ok(()) => {
                self.metrics.record_written();
                debug!(worker = self.id, camera = %camera, frame_id, path = ?path, "frame saved");
                delivery.ack(Outcome::Saved);
            }
            Err(failure) => {
                self.metrics.record_failure();
                warn!(worker = self.id, camera = %camera, frame_id, error = %failure, "frame lost");
                delivery.ack(Outcome::from(&failure));
            }
        }
    }

    fn persist(&self, path: &Path, payload: &[u8]) -> Result<(), FrameFailure> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            let start = self.metrics.start_write();
            let result = self.sink.persist(self.id, path, payload);
            self.metrics.finish_write(start);

            match result {
                Ok(()) => return Ok(()),
                Err(source) if attempt >= max_attempts => {
                    return Err(FrameFailure::WriteFailure {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    debug!(worker = self.id, path = ?path, attempt, error = %e, "write failed, retrying");
                    self.metrics.record_retry();
                    thread::sleep(self.retry.backoff(attempt));
                    attempt += 1;
                }
            }
        }
    }
}

/// W save workers sharing one frame receiver
pub struct WorkerPool {
    tasks: JoinSet<u64>,
    collector: MetricsCollector,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        frames: &FrameReceiver,
        layout: Arc<PathLayout>,
        sink: Arc<dyn FrameSink>,
        retry: &RetryPolicy,
    ) -> Self {
        let mut tasks = JoinSet::new();
        let mut collector = MetricsCollector::new();

        for id in 0..count {
            let worker = SaveWorker::new(
                id,
                frames.clone(),
                layout.clone(),
                sink.clone(),
                retry.clone(),
            );
            collector.register(worker.metrics());
            tasks.spawn_blocking(move || worker.run());
        }

        info!(workers = count, "save worker pool started");
        Self { tasks, collector }
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.collector
    }

    /// Workers that have not exited yet
    pub fn alive(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next worker to exit; `None` when none are left
    pub async fn next_exit(&mut self) -> Option<Result<u64, JoinError>> {
        self.tasks.join_next().await
    }

    /// Wait for every worker to exit, detaching the ones still busy after
    /// `grace`. Returns the number of detached workers.
    pub async fn shutdown(mut self, grace: Option<Duration>) -> (MetricsCollector, usize) {
        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "save worker ended abnormally");
                }
            }
        };

        let completed = match grace {
            Some(limit) => tokio::time::timeout(limit, drain).await.is_ok(),
            None => {
                drain.await;
                true
            }
        };

        let detached = if completed { 0 } else { self.tasks.len() };
        if detached > 0 {
            warn!(detached, "save workers still busy, detaching");
            self.tasks.detach_all();
        }
        (self.collector, detached)
    }
}
