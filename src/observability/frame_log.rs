use crate::core::CameraId;
use crate::error::PipelineError;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Serialize)]
struct FrameRecord<'a> {
    camera: &'a str,
    frame_id: u64,
    timestamp_us: u64,
}

/// CSV log with one row per published frame, shared by every capture source.
///
/// Rows of one camera appear in capture order; rows of different cameras
/// interleave as they were published.
pub struct FrameLog {
    path: PathBuf,
    wtr: Mutex<csv::Writer<File>>,
}

impl FrameLog {
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        let wtr = csv::Writer::from_path(path).map_err(|source| PipelineError::FrameLog {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            wtr: Mutex::new(wtr),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, camera: &CameraId, frame_id: u64, timestamp_us: u64) -> csv::Result<()> {
        let mut wtr = self.wtr.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        wtr.serialize(FrameRecord {
            camera: camera.as_str(),
            frame_id,
            timestamp_us,
        })
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.wtr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .flush()
    }
}

impl std::fmt::Debug for FrameLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLog").field("path", &self.path).finish()
    }
}
