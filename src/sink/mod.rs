use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Appends bytes to a single named file.
///
/// No handle is kept between calls: each append opens the file in append
/// mode, writes the whole buffer and closes it again, so a crash can leave
/// at most one partially written block behind.
#[derive(Debug, Clone)]
pub struct ByteSink {
    path: PathBuf,
}

impl ByteSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `bytes` to the file, creating it (and its parent directory) if needed.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating directory {}", parent.display()))?;
            }
        }

        let mut file = File::options()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {} for append", self.path.display()))?;

        file.write_all(bytes)
            .with_context(|| format!("appending to {}", self.path.display()))?;

        Ok(())
    }

    /// Current file size, or `None` if the file does not exist.
    pub fn size(&self) -> Result<Option<u64>> {
        file_size(&self.path).with_context(|| format!("reading size of {}", self.path.display()))
    }
}

/// Size of a regular file, `None` if it is missing.
pub fn file_size(path: &Path) -> io::Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
