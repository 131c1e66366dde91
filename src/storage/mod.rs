//! Persisted output layout: one file per frame, named from the camera id and
//! frame id, inside the directory the save directory map assigns to the camera.

pub mod layout;
pub mod sink;

pub use layout::{PathLayout, SaveDirectoryMap};
pub use sink::{DiskSink, FrameSink};
