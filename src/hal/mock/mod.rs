pub mod camera;

pub use camera::{SimulatedCamera, Trigger};
