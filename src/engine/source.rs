use crate::core::CameraId;
use crate::engine::channel::{FrameSender, SendRejected};
use crate::hal::{CameraHandle, Grab};
use crate::observability::{CaptureStats, FrameLog};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lifecycle of one capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Running,
    /// The camera reported end of stream
    Finished,
    /// Stopped on request, or by a forced teardown
    Cancelled,
    Failed { reason: String },
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running => f.write_str("running"),
            Self::Finished => f.write_str("finished"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub grab_timeout: Duration,
    pub warmup_frames: u64,
    pub critical_interval: Duration,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            grab_timeout: Duration::from_millis(1000),
            warmup_frames: 0,
            critical_interval: Duration::from_millis(40),
        }
    }
}

/// What a capture source hands back to the coordinator when it stops.
///
/// The camera is returned unreleased; releasing it is the coordinator's job
/// once the channel has drained.
pub struct SourceExit {
    pub camera: Box<dyn CameraHandle>,
    pub state: SourceState,
    pub stats: CaptureStats,
}

/// Pulls frames from one camera and publishes them to the frame channel
pub struct CaptureSource {
    camera: Box<dyn CameraHandle>,
    frames: FrameSender,
    stop: watch::Receiver<bool>,
    settings: SourceSettings,
    stats: CaptureStats,
    frame_log: Option<Arc<FrameLog>>,
}

impl CaptureSource {
    pub fn new(
        camera: Box<dyn CameraHandle>,
        frames: FrameSender,
        stop: watch::Receiver<bool>,
        settings: SourceSettings,
    ) -> Self {
        let stats = CaptureStats::new(settings.critical_interval);
        Self {
            camera,
            frames,
            stop,
            settings,
            stats,
            frame_log: None,
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        self.camera.camera_id()
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Also append every published frame to `log`
    pub fn with_frame_log(mut self, log: Arc<FrameLog>) -> Self {
        self.frame_log = Some(log);
        self
    }

    /// Blocking acquisition loop.
    ///
    /// Runs until a stop is requested, the camera ends its stream, or the
    /// camera fails. A frame already pulled from the camera is always
    /// published before the stop request is looked at again. A panic inside
    /// the loop marks the source failed; the camera is still handed back.
    pub fn run(mut self) -> SourceExit {
        let camera_id = self.camera.camera_id().clone();
        info!(camera = %camera_id, "capture source started");

        let state = match panic::catch_unwind(AssertUnwindSafe(|| self.acquire(&camera_id))) {
            Ok(state) => state,
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(camera = %camera_id, panic = %message, "capture loop panicked");
                SourceState::Failed {
                    reason: format!("capture loop panicked: {}", message),
                }
            }
        };

        info!(
            camera = %camera_id,
            state = %state,
            captured = self.stats.captured,
            "capture source stopped"
        );

        SourceExit {
            camera: self.camera,
            state,
            stats: self.stats,
        }
    }

    fn acquire(&mut self, camera_id: &CameraId) -> SourceState {
        let mut warmup = self.settings.warmup_frames;
        let mut log_failed = false;

        loop {
            if self.stop_requested() {
                return SourceState::Cancelled;
            }

            match self.camera.next_frame(self.settings.grab_timeout) {
                Ok(Grab::Frame(frame)) => {
                    if warmup > 0 {
                        warmup -= 1;
                        self.stats.record_warmup();
                        continue;
                    }

                    self.stats.observe(&frame);
                    let frame_id = frame.frame_id();
                    let timestamp_us = frame.timestamp_us();
                    debug!(camera = %camera_id, frame_id, "frame acquired");

                    if let Err(rejected) = self.frames.send(frame) {
                        warn!(camera = %camera_id, frame_id, ?rejected, "frame channel refused frame");
                        return match rejected {
                            SendRejected::Aborted => SourceState::Cancelled,
                            SendRejected::Disconnected => SourceState::Failed {
                                reason: "frame channel disconnected".to_string(),
                            },
                        };
                    }

                    if let Some(log) = &self.frame_log {
                        if let Err(e) = log.record(camera_id, frame_id, timestamp_us) {
                            if !log_failed {
                                warn!(camera = %camera_id, path = ?log.path(), error = %e, "frame log write failed");
                                log_failed = true;
                            }
                        }
                    }
                }
                Ok(Grab::Idle) => continue,
                Ok(Grab::EndOfStream) => return SourceState::Finished,
                Err(e) => {
                    warn!(camera = %camera_id, error = %e, "camera read failed");
                    return SourceState::Failed {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }
}
