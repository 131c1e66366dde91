use super::{CaptureStats, WorkerSnapshot};
use crate::core::CameraId;
use crate::engine::channel::CameraLedger;
use crate::engine::SourceState;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Per-camera outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct CameraReport {
    pub source: SourceState,
    /// Frames handed to the channel
    pub captured: u64,
    pub saved: u64,
    pub write_failures: u64,
    pub unknown_camera: u64,
    pub abandoned: u64,
    /// Still pending when a drain timeout forced teardown
    pub unacknowledged: u64,
    pub diagnostics: CaptureStats,
}

impl CameraReport {
    pub fn new(source: SourceState, ledger: &CameraLedger, diagnostics: CaptureStats) -> Self {
        Self {
            source,
            captured: ledger.enqueued,
            saved: ledger.saved,
            write_failures: ledger.write_failures,
            unknown_camera: ledger.unknown_camera,
            abandoned: ledger.abandoned,
            unacknowledged: ledger.pending(),
            diagnostics,
        }
    }

    pub fn lost(&self) -> u64 {
        self.write_failures + self.unknown_camera + self.abandoned + self.unacknowledged
    }
}

/// Final summary produced once the pipeline reaches a terminal state
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub final_state: String,
    pub cameras: BTreeMap<CameraId, CameraReport>,
    pub workers: Vec<WorkerSnapshot>,
    pub drain_timed_out: bool,
    pub unacknowledged: u64,
    pub elapsed_ms: u64,
}

impl PipelineReport {
    pub fn camera(&self, camera: &str) -> Option<&CameraReport> {
        self.cameras.get(&CameraId::from(camera))
    }

    pub fn captured(&self) -> u64 {
        self.cameras.values().map(|c| c.captured).sum()
    }

    pub fn saved(&self) -> u64 {
        self.cameras.values().map(|c| c.saved).sum()
    }

    pub fn write_failures(&self) -> u64 {
        self.cameras.values().map(|c| c.write_failures).sum()
    }

    pub fn unknown_camera(&self) -> u64 {
        self.cameras.values().map(|c| c.unknown_camera).sum()
    }

    pub fn lost(&self) -> u64 {
        self.cameras.values().map(CameraReport::lost).sum()
    }

    pub fn failed_cameras(&self) -> Vec<&CameraId> {
        self.cameras
            .iter()
            .filter(|(_, c)| matches!(c.source, SourceState::Failed { .. }))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {:?}", path))
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Recording Report ({}) ===", self.final_state)?;
        writeln!(
            f,
            "captured {} | saved {} | lost {} | {} ms",
            self.captured(),
            self.saved(),
            self.lost(),
            self.elapsed_ms
        )?;
        if self.drain_timed_out {
            writeln!(
                f,
                "drain timed out: {} frames unacknowledged",
                self.unacknowledged
            )?;
        }

        for (camera, report) in &self.cameras {
            let stats = &report.diagnostics;
            writeln!(f, "\n[{}] {}", camera, report.source)?;
            writeln!(
                f,
                "  Frames: {} captured, {} saved, {} write failures, {} unknown camera, {} abandoned",
                report.captured,
                report.saved,
                report.write_failures,
                report.unknown_camera,
                report.abandoned
            )?;
            match stats.average_fps() {
                Some(fps) => writeln!(
                    f,
                    "  Timing: {:.2} s, {:.2} fps, {} critical intervals, {} camera drops",
                    stats.duration_us() as f64 / 1_000_000.0,
                    fps,
                    stats.critical_intervals,
                    stats.camera_drops
                )?,
                None => writeln!(f, "  Timing: not enough frames")?,
            }
        }

        if !self.workers.is_empty() {
            writeln!(f)?;
            for worker in &self.workers {
                writeln!(
                    f,
                    "  worker {}: {} written, {} failed, avg {}μs",
                    worker.worker, worker.frames_written, worker.write_failures, worker.avg_write_us
                )?;
            }
        }
        Ok(())
    }
}
