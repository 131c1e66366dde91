pub mod frame;

pub use frame::{CameraId, Frame};
