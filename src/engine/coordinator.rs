use crate::config::PipelineConfig;
use crate::core::CameraId;
use crate::engine::channel::FrameChannel;
use crate::engine::source::{CaptureSource, SourceExit, SourceSettings, SourceState};
use crate::engine::state::PipelineState;
use crate::engine::worker::WorkerPool;
use crate::error::PipelineError;
use crate::hal::CameraHandle;
use crate::observability::{CameraReport, CaptureStats, FrameLog, MetricsCollector, PipelineReport};
use crate::storage::{DiskSink, FrameSink, PathLayout};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How long stuck workers or sources get after a forced teardown
const DETACH_GRACE: Duration = Duration::from_millis(200);

/// External stop request for a running pipeline.
///
/// Cloneable and idempotent; safe to call from a signal handler task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Owns one recording run: starts capture sources and save workers,
/// watches them, and drains the channel before the cameras are released.
///
/// A coordinator runs once. Start a new one for every recording.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    cameras: Vec<Box<dyn CameraHandle>>,
    sink: Arc<dyn FrameSink>,
    state: PipelineState,
    stop_tx: Arc<watch::Sender<bool>>,
    used: bool,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig, cameras: Vec<Box<dyn CameraHandle>>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let sink = Arc::new(DiskSink::new().with_sync(config.sync_writes));
        Self {
            config,
            cameras,
            sink,
            state: PipelineState::Idle,
            stop_tx: Arc::new(stop_tx),
            used: false,
        }
    }

    /// Replace the filesystem writer, e.g. with a sink that injects failures
    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Get current pipeline state
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Transition to a new state with validation
    pub fn transition_to(&mut self, new_state: PipelineState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(&new_state) {
            return Err(PipelineError::InvalidTransition {
                from: self.state.name(),
                to: new_state.name(),
            });
        }
        info!(from = self.state.name(), to = new_state.name(), "pipeline state change");
        self.state = new_state;
        Ok(())
    }

    /// Run the pipeline to completion.
    ///
    /// Returns once every capture source has stopped and the channel has
    /// drained (or the drain timeout forced a teardown). Only configuration
    /// problems are returned as errors; per-camera and per-frame failures end
    /// up in the report.
    pub async fn run(&mut self) -> Result<PipelineReport, PipelineError> {
        if self.used {
            return Err(PipelineError::AlreadyRun);
        }
        self.used = true;
        let started = Instant::now();

        self.transition_to(PipelineState::Initializing)?;
        let (layout, frame_log) = match self.initialize() {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(error = %e, "pipeline setup failed");
                self.release_unstarted();
                self.transition_to(PipelineState::Failed {
                    reason: e.to_string(),
                })?;
                return Err(e);
            }
        };

        let mut channel = FrameChannel::new(
            self.config.channel_capacity,
            self.config.preserve_camera_order,
        );
        let producer = channel.sender().ok_or_else(|| {
            PipelineError::Configuration("frame channel closed before start".to_string())
        })?;

        let mut pool = WorkerPool::spawn(
            self.config.workers,
            &channel.receiver(),
            Arc::new(layout),
            self.sink.clone(),
            &self.config.retry,
        );

        self.transition_to(PipelineState::Running)?;

        let settings = SourceSettings {
            grab_timeout: self.config.grab_timeout(),
            warmup_frames: self.config.warmup_frames,
            critical_interval: self.config.critical_interval(),
        };
        let camera_ids: Vec<CameraId> = self.cameras.iter().map(|c| c.camera_id().clone()).collect();
        let mut sources = JoinSet::new();
        for camera in std::mem::take(&mut self.cameras) {
            let mut source = CaptureSource::new(
                camera,
                producer.clone(),
                self.stop_tx.subscribe(),
                settings.clone(),
            );
            if let Some(log) = &frame_log {
                source = source.with_frame_log(log.clone());
            }
            sources.spawn_blocking(move || source.run());
        }
        drop(producer);
        info!(
            cameras = camera_ids.len(),
            workers = self.config.workers,
            capacity = channel.capacity(),
            "pipeline running"
        );

        let mut exits = Vec::with_capacity(camera_ids.len());
        Self::monitor(
            self.stop_tx.subscribe(),
            &mut sources,
            &mut pool,
            &channel,
            &mut exits,
        )
        .await;

        self.transition_to(PipelineState::Draining)?;
        self.stop_tx.send_replace(true);

        let drain = Self::drain(
            &mut channel,
            &mut sources,
            &mut exits,
            self.config.drain_timeout(),
        )
        .await;

        let unacknowledged = match &drain {
            Ok(()) => 0,
            Err(e) => {
                warn!(error = %e, "forcing teardown");
                let pending = match e {
                    PipelineError::DrainTimeout { unacknowledged, .. } => *unacknowledged,
                    _ => channel.pending(),
                };
                channel.abort();
                let limit = self.config.grab_timeout() + DETACH_GRACE;
                if tokio::time::timeout(limit, Self::collect_sources(&mut sources, &mut exits))
                    .await
                    .is_err()
                {
                    warn!(sources = sources.len(), "capture sources did not stop, detaching");
                    sources.detach_all();
                }
                channel.discard_queued();
                pending
            }
        };

        let grace = drain.is_err().then_some(DETACH_GRACE);
        let (metrics, detached) = pool.shutdown(grace).await;
        if detached > 0 {
            warn!(detached, "save workers left running after teardown");
        }

        if let Some(log) = &frame_log {
            if let Err(e) = log.flush() {
                warn!(path = ?log.path(), error = %e, "failed to flush frame log");
            }
        }

        for exit in exits.iter_mut() {
            if let Err(e) = exit.camera.release() {
                warn!(camera = %exit.camera.camera_id(), error = %e, "camera release failed");
            }
        }

        self.transition_to(PipelineState::Stopped)?;

        let report = self.build_report(
            &channel,
            &camera_ids,
            exits,
            &metrics,
            drain.is_err(),
            unacknowledged,
            started.elapsed(),
        );
        info!(
            captured = report.captured(),
            saved = report.saved(),
            lost = report.lost(),
            "pipeline stopped"
        );

        if let Some(path) = &self.config.report_path {
            if let Err(e) = report.write_json(path) {
                warn!(error = %e, "failed to write report");
            }
        }
        Ok(report)
    }

    fn initialize(&self) -> Result<(PathLayout, Option<Arc<FrameLog>>), PipelineError> {
        self.config.validate()?;

        if self.cameras.is_empty() {
            return Err(PipelineError::Configuration(
                "no camera handles supplied".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.camera_id()) {
                return Err(PipelineError::Configuration(format!(
                    "camera {} supplied more than once",
                    camera.camera_id()
                )));
            }
        }

        let missing = self.config.save_dirs.missing(&self.config.expected_cameras);
        if !missing.is_empty() {
            let names: Vec<&str> = missing.iter().map(CameraId::as_str).collect();
            return Err(PipelineError::Configuration(format!(
                "no save directory for camera(s): {}",
                names.join(", ")
            )));
        }

        for camera in &self.cameras {
            if !self.config.save_dirs.contains(camera.camera_id()) {
                warn!(camera = %camera.camera_id(), "no save directory, frames will be reported as unknown camera");
            }
        }

        if self.config.create_dirs {
            self.config.save_dirs.create_all()?;
        }

        let frame_log = match &self.config.frame_log {
            Some(path) => Some(Arc::new(FrameLog::create(path)?)),
            None => None,
        };

        let layout = PathLayout::new(self.config.save_dirs.clone(), &self.config.extension);
        Ok((layout, frame_log))
    }

    fn release_unstarted(&mut self) {
        for camera in self.cameras.iter_mut() {
            if let Err(e) = camera.release() {
                warn!(camera = %camera.camera_id(), error = %e, "camera release failed");
            }
        }
    }

    /// Wait in `Running` until every source has stopped, a stop was
    /// requested, or the whole worker pool is gone.
    async fn monitor(
        mut cancel_rx: watch::Receiver<bool>,
        sources: &mut JoinSet<SourceExit>,
        pool: &mut WorkerPool,
        channel: &FrameChannel,
        exits: &mut Vec<SourceExit>,
    ) {
        if *cancel_rx.borrow_and_update() {
            info!("stop requested before start");
            return;
        }

        loop {
            if sources.is_empty() {
                info!("all capture sources finished");
                return;
            }
            let workers_alive = pool.alive() > 0;

            tokio::select! {
                joined = sources.join_next() => {
                    if let Some(exit) = joined.and_then(Self::source_joined) {
                        exits.push(exit);
                    }
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow_and_update() {
                        info!("stop requested");
                        return;
                    }
                }
                exited = pool.next_exit(), if workers_alive => {
                    match exited {
                        Some(Err(e)) => error!(error = %e, "save worker crashed"),
                        _ => warn!("save worker exited while running"),
                    }
                    if pool.alive() == 0 {
                        error!("no save workers left, aborting the frame channel");
                        channel.abort();
                        return;
                    }
                }
            }
        }
    }

    /// Stop sources, then wait for the join barrier, all under one deadline
    async fn drain(
        channel: &mut FrameChannel,
        sources: &mut JoinSet<SourceExit>,
        exits: &mut Vec<SourceExit>,
        timeout: Option<Duration>,
    ) -> Result<(), PipelineError> {
        let Some(limit) = timeout else {
            Self::collect_sources(sources, exits).await;
            channel.close();
            if channel.is_aborted() {
                channel.discard_queued();
            }
            channel.join().await;
            return Ok(());
        };

        let deadline = Instant::now() + limit;
        let stopped = tokio::time::timeout_at(deadline, Self::collect_sources(sources, exits))
            .await
            .is_ok();
        channel.close();
        if channel.is_aborted() {
            channel.discard_queued();
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if stopped && channel.join_timeout(Some(remaining)).await.is_ok() {
            return Ok(());
        }
        Err(PipelineError::DrainTimeout {
            waited: limit,
            unacknowledged: channel.pending(),
        })
    }

    async fn collect_sources(sources: &mut JoinSet<SourceExit>, exits: &mut Vec<SourceExit>) {
        while let Some(joined) = sources.join_next().await {
            if let Some(exit) = Self::source_joined(joined) {
                exits.push(exit);
            }
        }
    }

    fn source_joined(joined: Result<SourceExit, JoinError>) -> Option<SourceExit> {
        match joined {
            Ok(exit) => {
                if let SourceState::Failed { reason } = &exit.state {
                    warn!(camera = %exit.camera.camera_id(), reason = %reason, "capture source failed, continuing with the rest");
                }
                Some(exit)
            }
            Err(e) => {
                error!(error = %e, "capture source task ended abnormally");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        channel: &FrameChannel,
        camera_ids: &[CameraId],
        exits: Vec<SourceExit>,
        metrics: &MetricsCollector,
        drain_timed_out: bool,
        unacknowledged: u64,
        elapsed: Duration,
    ) -> PipelineReport {
        let ledger = channel.snapshot();
        let mut finished: BTreeMap<CameraId, (SourceState, CaptureStats)> = exits
            .into_iter()
            .map(|exit| (exit.camera.camera_id().clone(), (exit.state, exit.stats)))
            .collect();

        let ids: BTreeSet<CameraId> = camera_ids
            .iter()
            .cloned()
            .chain(ledger.cameras().map(|(id, _)| id.clone()))
            .collect();

        let cameras = ids
            .into_iter()
            .map(|id| {
                let (source, stats) = finished.remove(&id).unwrap_or_else(|| {
                    (
                        SourceState::Failed {
                            reason: "capture task did not report back".to_string(),
                        },
                        CaptureStats::new(self.config.critical_interval()),
                    )
                });
                let counts = ledger.camera(&id).cloned().unwrap_or_default();
                let report = CameraReport::new(source, &counts, stats);
                (id, report)
            })
            .collect();

        PipelineReport {
            final_state: self.state.name().to_string(),
            cameras,
            workers: metrics.snapshot(),
            drain_timed_out,
            unacknowledged,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::SimulatedCamera;
    use crate::storage::SaveDirectoryMap;
    use tempfile::tempdir;

    fn camera(id: &str, frames: u64) -> Box<dyn CameraHandle> {
        Box::new(
            SimulatedCamera::new(id)
                .with_frames(frames)
                .with_interval(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let mut coordinator = PipelineCoordinator::new(PipelineConfig::default(), Vec::new());
        let err = coordinator
            .transition_to(PipelineState::Stopped)
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { from: "Idle", to: "Stopped" }));
    }

    #[tokio::test]
    async fn test_duplicate_camera_is_configuration_error() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            save_dirs: SaveDirectoryMap::new().with("camA", dir.path()),
            ..Default::default()
        };
        let mut coordinator =
            PipelineCoordinator::new(config, vec![camera("camA", 1), camera("camA", 1)]);

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        assert_eq!(coordinator.state().name(), "Failed");
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            save_dirs: SaveDirectoryMap::new().with("camA", dir.path()),
            workers: 1,
            ..Default::default()
        };
        let mut coordinator = PipelineCoordinator::new(config, vec![camera("camA", 2)]);

        let report = coordinator.run().await.unwrap();
        assert_eq!(report.saved(), 2);
        assert!(matches!(coordinator.run().await, Err(PipelineError::AlreadyRun)));
    }

    #[test]
    fn test_cancel_handle_is_idempotent() {
        let coordinator = PipelineCoordinator::new(PipelineConfig::default(), Vec::new());
        let handle = coordinator.cancel_handle();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.clone().cancel();
        assert!(handle.is_cancelled());
    }
}
