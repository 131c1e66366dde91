pub mod collector;
pub mod diagnostics;
pub mod frame_log;
pub mod metrics;
pub mod report;

pub use collector::MetricsCollector;
pub use diagnostics::CaptureStats;
pub use frame_log::FrameLog;
pub use metrics::{WorkerMetrics, WorkerSnapshot};
pub use report::{CameraReport, PipelineReport};
