use crate::core::CameraId;
use crate::error::{FrameFailure, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Mapping from camera id to the directory its frames are saved in.
///
/// Fixed for the lifetime of one run and read-only once the pipeline starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveDirectoryMap {
    dirs: BTreeMap<CameraId, PathBuf>,
}

impl SaveDirectoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, camera: impl Into<CameraId>, dir: impl Into<PathBuf>) {
        self.dirs.insert(camera.into(), dir.into());
    }

    /// Builder-style insert
    pub fn with(mut self, camera: impl Into<CameraId>, dir: impl Into<PathBuf>) -> Self {
        self.insert(camera, dir);
        self
    }

    pub fn get(&self, camera: &CameraId) -> Option<&Path> {
        self.dirs.get(camera).map(PathBuf::as_path)
    }

    pub fn contains(&self, camera: &CameraId) -> bool {
        self.dirs.contains_key(camera)
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn cameras(&self) -> impl Iterator<Item = &CameraId> {
        self.dirs.keys()
    }

    /// Cameras from `expected` that have no directory, in input order
    pub fn missing<'a>(&self, expected: impl IntoIterator<Item = &'a CameraId>) -> Vec<CameraId> {
        expected
            .into_iter()
            .filter(|camera| !self.contains(camera))
            .cloned()
            .collect()
    }

    /// Create every mapped directory that does not exist yet
    pub fn create_all(&self) -> Result<(), PipelineError> {
        for dir in self.dirs.values() {
            fs::create_dir_all(dir).map_err(|source| PipelineError::SaveDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl<C: Into<CameraId>, P: Into<PathBuf>> FromIterator<(C, P)> for SaveDirectoryMap {
    fn from_iter<I: IntoIterator<Item = (C, P)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (camera, dir) in iter {
            map.insert(camera, dir);
        }
        map
    }
}

/// Deterministic frame path resolution.
///
/// `{dir}/{camera}_{frame_id}.{ext}`; characters of the camera id that are not
/// safe in a file name are replaced with `_`.
#[derive(Debug, Clone)]
pub struct PathLayout {
    dirs: SaveDirectoryMap,
    extension: String,
}

impl PathLayout {
    pub fn new(dirs: SaveDirectoryMap, extension: &str) -> Self {
        Self {
            dirs,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dirs(&self) -> &SaveDirectoryMap {
        &self.dirs
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn file_name(&self, camera: &CameraId, frame_id: u64) -> String {
        format!("{}_{}.{}", sanitize(camera.as_str()), frame_id, self.extension)
    }

    pub fn resolve(&self, camera: &CameraId, frame_id: u64) -> Result<PathBuf, FrameFailure> {
        let dir = self
            .dirs
            .get(camera)
            .ok_or_else(|| FrameFailure::UnknownCamera(camera.clone()))?;
        Ok(dir.join(self.file_name(camera, frame_id)))
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
