//! A sink writing one file on the local filesystem.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::ZarrError;
use crate::sink::Sink;

/// A sink over a regular file. Creation truncates any existing file and
/// creates missing parent directories.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    /// Create (or truncate) the file at `path`.
    ///
    /// A `file://` prefix is stripped. Parent directories are created if
    /// missing; `create_dir_all` is idempotent, so concurrent sink creation
    /// under a shared parent is safe.
    ///
    /// # Errors
    /// Returns [`ZarrError::IOError`] if the directories or the file cannot
    /// be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ZarrError> {
        let path = path.as_ref();
        let path = path
            .to_str()
            .and_then(|s| s.strip_prefix("file://"))
            .map_or_else(|| path.to_path_buf(), PathBuf::from);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    ZarrError::IOError(format!(
                        "failed to create directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }

        let file = File::create(&path).map_err(|err| {
            ZarrError::IOError(format!("failed to create file '{}': {err}", path.display()))
        })?;
        Ok(Self { path, file })
    }

    /// The path this sink writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), ZarrError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ZarrError> {
        self.file.flush()?;
        Ok(())
    }
}
