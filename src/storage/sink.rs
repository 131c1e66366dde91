use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Blocking write of one frame payload.
///
/// Implementations are called from save worker threads only, never from a
/// capture source.
pub trait FrameSink: Send + Sync {
    fn persist(&self, worker: usize, path: &Path, payload: &[u8]) -> io::Result<()>;
}

/// Writes payloads to the local filesystem.
///
/// Data goes to a `.part` sibling first and is renamed into place, so a
/// crashed write never leaves a truncated file under the final name.
#[derive(Debug, Clone, Default)]
pub struct DiskSink {
    sync_data: bool,
}

impl DiskSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// fsync every file before renaming it into place
    pub fn with_sync(mut self, sync_data: bool) -> Self {
        self.sync_data = sync_data;
        self
    }
}

impl FrameSink for DiskSink {
    fn persist(&self, _worker: usize, path: &Path, payload: &[u8]) -> io::Result<()> {
        let partial = partial_path(path);
        let mut file = File::create(&partial)?;
        file.write_all(payload)?;
        if self.sync_data {
            file.sync_data()?;
        }
        drop(file);

        fs::rename(&partial, path).inspect_err(|_| {
            let _ = fs::remove_file(&partial);
        })
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
