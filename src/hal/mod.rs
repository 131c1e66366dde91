pub mod mock;
pub mod traits;

pub use traits::{CameraHandle, Grab};
