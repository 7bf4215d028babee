//! Sentinel-file stop signal for the freshness tailer.
//!
//! Creating the file (`touch /tmp/stop_page_one_loop`) asks a running tailer
//! to finish its current cycle and exit; the tailer removes the file when it
//! honours the request.

use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StopFile {
    path: PathBuf,
}

impl StopFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a stop was requested; unreadable locations count as "no"
    pub async fn is_raised(&self) -> bool {
        match tokio::fs::try_exists(&self.path).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(path = %self.path.display(), "Cannot check stop file: {err}");
                false
            }
        }
    }

    pub async fn raise(&self) -> io::Result<()> {
        tokio::fs::write(&self.path, b"").await
    }

    /// Removes the file; a file that is already gone is not an error
    pub async fn clear(&self) -> io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}
