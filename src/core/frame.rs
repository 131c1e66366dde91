use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of the camera that produced a frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CameraId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CameraId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One captured image plus its camera/sequence/time metadata.
///
/// A frame is created once by a capture source and then moved through the
/// pipeline; it is intentionally not `Clone` so that exactly one save worker
/// can ever own it.
#[derive(Debug)]
pub struct Frame {
    camera_id: CameraId,
    frame_id: u64,
    /// Capture time in microseconds, on the clock of the producing camera
    timestamp_us: u64,
    payload: Box<[u8]>,
}

impl Frame {
    pub fn new(
        camera_id: CameraId,
        frame_id: u64,
        timestamp_us: u64,
        payload: impl Into<Box<[u8]>>,
    ) -> Self {
        Self {
            camera_id,
            frame_id,
            timestamp_us,
            payload: payload.into(),
        }
    }

    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    /// Per-camera sequence number assigned by the device
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(CameraId::from("camA"), 7, 1_500, vec![1u8, 2, 3]);

        assert_eq!(frame.camera_id().as_str(), "camA");
        assert_eq!(frame.frame_id(), 7);
        assert_eq!(frame.timestamp_us(), 1_500);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
    }

    #[test]
    fn test_camera_id_serializes_as_plain_string() {
        let id = CameraId::from("USB-1E10");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"USB-1E10\"");
    }
}
