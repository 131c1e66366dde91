use crate::core::{CameraId, Frame};
use crate::error::DeviceError;
use std::time::Duration;

/// Outcome of a single wait on a camera
#[derive(Debug)]
pub enum Grab {
    Frame(Frame),
    /// No trigger arrived within the timeout; not an error
    Idle,
    /// The device will produce no more frames
    EndOfStream,
}

/// An initialized, already configured camera.
///
/// Trigger mode, exposure and frame rate are set up by the vendor integration
/// before the handle reaches the pipeline. A handle is owned by exactly one
/// capture source while acquisition runs and is handed back to the
/// coordinator for `release` once every frame it produced has been drained.
pub trait CameraHandle: Send {
    fn camera_id(&self) -> &CameraId;

    /// Block until the next frame, the timeout or the end of the stream.
    ///
    /// The timeout bounds how long a capture source can go without observing
    /// cancellation; hardware-triggered cameras may legitimately idle for a
    /// long time.
    fn next_frame(&mut self, timeout: Duration) -> Result<Grab, DeviceError>;

    /// End acquisition and de-initialize the device
    fn release(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}
