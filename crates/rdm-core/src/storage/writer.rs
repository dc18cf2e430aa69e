//! Concurrent offset writer for the destination download file.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
#[cfg(unix)]
use std::os::unix::fs::FileExt;

/// Writer for a destination download file. Safe to clone and use from
/// multiple tasks; each `write_at` is independent (pwrite-style) and does
/// not move a shared cursor, so N Part Workers can write their disjoint
/// ranges concurrently.
#[derive(Clone)]
pub struct StorageWriter {
    file: Arc<File>,
    path: std::path::PathBuf,
}

impl StorageWriter {
    /// Create from an open file and path (used by `StorageWriterBuilder`).
    pub(crate) fn from_file_and_path(file: File, path: std::path::PathBuf) -> Self {
        Self {
            file: Arc::new(file),
            path,
        }
    }

    /// Open an existing destination file for resume (read+write, no
    /// truncation). The file must already exist and have been preallocated.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open existing destination file: {}", path.display()))?;
        Ok(StorageWriter {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Write `data` at `offset`. Does not change the file's logical cursor; safe for concurrent use.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let n = self
            .file
            .write_at(data, offset)
            .context("storage write_at failed")?;
        if n != data.len() {
            anyhow::bail!("short write: {} of {}", n, data.len());
        }
        Ok(())
    }

    /// Fallback for non-Unix targets: seek + write. Not safe for concurrent use.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    /// Sync file data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("storage sync failed")?;
        Ok(())
    }

    /// Path to the destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the destination file to zero length (single-threaded mode,
    /// restart-from-scratch when resume is not supported).
    pub fn truncate(&self) -> Result<()> {
        self.file.set_len(0).context("storage truncate failed")?;
        Ok(())
    }
}
