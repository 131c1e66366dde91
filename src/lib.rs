pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod hal;
pub mod observability;
pub mod resilience;
pub mod storage;

pub use config::PipelineConfig;
pub use engine::{CancelHandle, PipelineCoordinator, PipelineState};
pub use error::{DeviceError, FrameFailure, PipelineError};
