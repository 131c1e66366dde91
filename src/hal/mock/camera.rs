use crate::core::{CameraId, Frame};
use crate::error::DeviceError;
use crate::hal::{CameraHandle, Grab};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum TriggerMode {
    Periodic { interval: Duration },
    Manual { rx: Receiver<()> },
}

/// Fires frames on a camera created with [`SimulatedCamera::manual`]
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: Sender<()>,
}

impl Trigger {
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }
}

/// Software stand-in for a hardware-triggered camera.
///
/// Produces `frames` frames (unbounded when `None`) either on a fixed period
/// or on manual triggers. Can be told to fail after a number of frames or to
/// skip frame ids to mimic drops inside the device buffer.
#[derive(Debug)]
pub struct SimulatedCamera {
    id: CameraId,
    mode: TriggerMode,
    frames: Option<u64>,
    payload_bytes: usize,
    fail_after: Option<u64>,
    skip_every: Option<u64>,
    produced: u64,
    next_frame_id: u64,
    start: Instant,
    next_due: Option<Instant>,
    released: Arc<AtomicBool>,
}

impl SimulatedCamera {
    pub fn new(id: impl Into<CameraId>) -> Self {
        Self {
            id: id.into(),
            mode: TriggerMode::Periodic {
                interval: Duration::from_millis(5),
            },
            frames: None,
            payload_bytes: 64,
            fail_after: None,
            skip_every: None,
            produced: 0,
            next_frame_id: 0,
            start: Instant::now(),
            next_due: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Camera that only produces a frame when its [`Trigger`] fires
    pub fn manual(id: impl Into<CameraId>) -> (Self, Trigger) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut camera = Self::new(id);
        camera.mode = TriggerMode::Manual { rx };
        (camera, Trigger { tx })
    }

    pub fn with_frames(mut self, frames: u64) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        if let TriggerMode::Periodic { .. } = self.mode {
            self.mode = TriggerMode::Periodic { interval };
        }
        self
    }

    pub fn with_payload_bytes(mut self, payload_bytes: usize) -> Self {
        self.payload_bytes = payload_bytes;
        self
    }

    /// Report a disconnect once `frames` frames have been produced
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Skip one frame id after every `n` frames
    pub fn skip_every(mut self, n: u64) -> Self {
        self.skip_every = Some(n.max(1));
        self
    }

    /// Flag set once the pipeline releases this camera
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    fn wait_for_trigger(&mut self, timeout: Duration) -> Result<bool, DeviceError> {
        match &self.mode {
            TriggerMode::Periodic { interval } => {
                let now = Instant::now();
                let due = *self.next_due.get_or_insert(now + *interval);
                let wait = due.saturating_duration_since(now);
                if wait > timeout {
                    thread::sleep(timeout);
                    return Ok(false);
                }
                thread::sleep(wait);
                self.next_due = Some(due + *interval);
                Ok(true)
            }
            TriggerMode::Manual { rx } => match rx.recv_timeout(timeout) {
                Ok(()) => Ok(true),
                Err(RecvTimeoutError::Timeout) => Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    Err(DeviceError::Disconnected(self.id.clone()))
                }
            },
        }
    }
}

impl CameraHandle for SimulatedCamera {
    fn camera_id(&self) -> &CameraId {
        &self.id
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Grab, DeviceError> {
        if self.released.load(Ordering::Acquire) {
            return Err(DeviceError::Read {
                camera: self.id.clone(),
                reason: "camera already released".to_string(),
            });
        }
        if self.frames.is_some_and(|limit| self.produced >= limit) {
            return Ok(Grab::EndOfStream);
        }
        if self.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(DeviceError::Disconnected(self.id.clone()));
        }

        if !self.wait_for_trigger(timeout)? {
            return Ok(Grab::Idle);
        }

        let frame_id = self.next_frame_id;
        let timestamp_us = self.start.elapsed().as_micros() as u64;
        let payload = vec![(frame_id % 251) as u8; self.payload_bytes];

        self.produced += 1;
        self.next_frame_id += 1;
        if self.skip_every.is_some_and(|n| self.produced % n == 0) {
            self.next_frame_id += 1;
        }

        Ok(Grab::Frame(Frame::new(
            self.id.clone(),
            frame_id,
            timestamp_us,
            payload,
        )))
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.released.store(true, Ordering::Release);
        Ok(())
    }
}
