use crate::core::CameraId;
use crate::error::PipelineError;
use crate::resilience::RetryPolicy;
use crate::storage::SaveDirectoryMap;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime knobs of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frame channel capacity; 0 means direct hand-off
    pub channel_capacity: usize,

    /// Number of save workers, independent of the camera count
    pub workers: usize,

    /// File extension of persisted frames
    pub extension: String,

    pub save_dirs: SaveDirectoryMap,

    /// Cameras that must have a save directory before the run may start
    pub expected_cameras: Vec<CameraId>,

    pub grab_timeout_ms: u64,

    /// Bound on the shutdown join barrier, unbounded when absent
    pub drain_timeout_ms: Option<u64>,

    /// Serialize writes per camera so files are written in capture order
    pub preserve_camera_order: bool,

    /// Frames discarded per camera before recording starts
    pub warmup_frames: u64,

    /// Inter-frame interval counted as critical in capture diagnostics
    pub critical_interval_ms: u64,

    pub retry: RetryPolicy,

    /// Where to write the final report as JSON
    pub report_path: Option<PathBuf>,

    pub create_dirs: bool,

    /// CSV file receiving one row per published frame
    pub frame_log: Option<PathBuf>,

    /// fsync every frame file before it is renamed into place
    pub sync_writes: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            workers: 10,
            extension: "raw".to_string(),
            save_dirs: SaveDirectoryMap::new(),
            expected_cameras: Vec::new(),
            grab_timeout_ms: 1000,
            drain_timeout_ms: None,
            preserve_camera_order: true,
            warmup_frames: 0,
            critical_interval_ms: 40,
            retry: RetryPolicy::Never,
            report_path: None,
            create_dirs: true,
            frame_log: None,
            sync_writes: false,
        }
    }
}

impl PipelineConfig {
    /// Parse from a JSON value; the pipeline settings may sit at the top level
    /// or under a `"pipeline_config"` key.
    pub fn from_json(config: Value) -> Result<Self> {
        let section = match config.get("pipeline_config") {
            Some(inner) => inner.clone(),
            None => config,
        };
        serde_json::from_value(section).context("Failed to parse pipeline config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let value: Value = serde_json::from_str(&json)
            .with_context(|| format!("Invalid JSON in {:?}", path))?;
        Self::from_json(value)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.workers == 0 {
            return Err(PipelineError::Configuration(
                "at least one save worker is required".to_string(),
            ));
        }
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(PipelineError::Configuration(
                "file extension must not be empty".to_string(),
            ));
        }
        if self.save_dirs.is_empty() {
            return Err(PipelineError::Configuration(
                "save directory map is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grab_timeout(&self) -> Duration {
        Duration::from_millis(self.grab_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn critical_interval(&self) -> Duration {
        Duration::from_millis(self.critical_interval_ms)
    }
}
