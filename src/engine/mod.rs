pub mod channel;
pub mod coordinator;
pub mod source;
pub mod state;
pub mod worker;

pub use channel::{CameraLedger, Delivery, FrameChannel, FrameReceiver, FrameSender, Ledger, Outcome};
pub use coordinator::{CancelHandle, PipelineCoordinator};
pub use source::{CaptureSource, SourceExit, SourceSettings, SourceState};
pub use state::PipelineState;
pub use worker::{SaveWorker, WorkerPool};
