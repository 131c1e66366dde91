use crate::core::Frame;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing diagnostics of one camera's recording.
///
/// Kept locally by the capture source, so it needs no synchronization.
/// Camera-side drops are inferred from gaps in the device frame ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub captured: u64,
    pub discarded_warmup: u64,
    pub camera_drops: u64,
    pub first_timestamp_us: Option<u64>,
    pub last_timestamp_us: Option<u64>,
    pub max_interval_us: u64,
    pub critical_intervals: u64,
    critical_threshold_us: u64,
    #[serde(skip)]
    last_frame_id: Option<u64>,
}

impl CaptureStats {
    pub fn new(critical_interval: Duration) -> Self {
        Self {
            critical_threshold_us: critical_interval.as_micros() as u64,
            ..Default::default()
        }
    }

    pub fn record_warmup(&mut self) {
        self.discarded_warmup += 1;
    }

    pub fn observe(&mut self, frame: &Frame) {
        let timestamp = frame.timestamp_us();

        if let Some(previous) = self.last_timestamp_us {
            let interval = timestamp.saturating_sub(previous);
            self.max_interval_us = self.max_interval_us.max(interval);
            if self.critical_threshold_us > 0 && interval > self.critical_threshold_us {
                self.critical_intervals += 1;
            }
        }
        if let Some(previous) = self.last_frame_id {
            self.camera_drops += frame.frame_id().saturating_sub(previous + 1);
        }

        self.first_timestamp_us.get_or_insert(timestamp);
        self.last_timestamp_us = Some(timestamp);
        self.last_frame_id = Some(frame.frame_id());
        self.captured += 1;
    }

    pub fn duration_us(&self) -> u64 {
        match (self.first_timestamp_us, self.last_timestamp_us) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    pub fn mean_interval_us(&self) -> Option<f64> {
        if self.captured < 2 {
            return None;
        }
        Some(self.duration_us() as f64 / (self.captured - 1) as f64)
    }

    pub fn average_fps(&self) -> Option<f64> {
        self.mean_interval_us()
            .filter(|mean| *mean > 0.0)
            .map(|mean| 1_000_000.0 / mean)
    }
}
