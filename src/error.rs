use crate::core::CameraId;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Pipeline-level errors.
///
/// Only `Configuration`, `SaveDirectory`, `FrameLog` and `InvalidTransition` stop a run
/// before it reaches `Running`. `DrainTimeout` is produced by the join barrier
/// and is recorded in the final report rather than propagated.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to prepare save directory {path:?}")]
    SaveDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create frame log {path:?}")]
    FrameLog {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("coordinator already used; create a new one for every run")]
    AlreadyRun,

    #[error("drain did not complete within {waited:?}, {unacknowledged} frames unacknowledged")]
    DrainTimeout {
        waited: Duration,
        unacknowledged: u64,
    },
}

/// Camera read or connection failure, local to one capture source
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("camera {0} disconnected")]
    Disconnected(CameraId),

    #[error("camera {camera} read failed: {reason}")]
    Read { camera: CameraId, reason: String },
}

/// Why a frame accepted into the channel was not persisted
#[derive(Debug, Error)]
pub enum FrameFailure {
    #[error("no save directory configured for camera {0}")]
    UnknownCamera(CameraId),

    #[error("failed to write {path:?} after {attempts} attempt(s)")]
    WriteFailure {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("frame abandoned before it was written")]
    Abandoned,
}
