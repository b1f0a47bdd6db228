//! Directory-backed image storage.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use crate::error::{CaptureError, Result};
use crate::traits::Storage;

/// Upper bound on `_n` suffixes tried for one timestamp.
const MAX_COLLISIONS: u32 = 1000;

/// Writes each image to `<dir>/burst_<utc-ms>.<ext>`.
///
/// Two images stamped in the same millisecond get `_1`, `_2`, ... suffixes
/// instead of overwriting each other.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    /// Store images under `dir`, created on first write.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    fn candidate(&self, captured_at_ms: i64, extension: &str, attempt: u32) -> PathBuf {
        let name = if attempt == 0 {
            format!("burst_{captured_at_ms}.{extension}")
        } else {
            format!("burst_{captured_at_ms}_{attempt}.{extension}")
        };
        self.dir.join(name)
    }
}

impl Storage for DirectoryStorage {
    fn persist(&self, bytes: &[u8], captured_at_ms: i64, extension: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            CaptureError::PersistenceFailed(format!("{}: {err}", self.dir.display()))
        })?;

        for attempt in 0..MAX_COLLISIONS {
            let path = self.candidate(captured_at_ms, extension, attempt);
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(CaptureError::PersistenceFailed(format!(
                        "{}: {err}",
                        path.display()
                    )))
                }
            };
            file.write_all(bytes)
                .and_then(|()| file.sync_all())
                .map_err(|err| {
                    CaptureError::PersistenceFailed(format!("{}: {err}", path.display()))
                })?;
            return Ok(path);
        }

        Err(CaptureError::PersistenceFailed(format!(
            "too many images stamped {captured_at_ms}"
        )))
    }
}
