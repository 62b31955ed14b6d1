//! Utility functions for treesum
//!
//! Small helpers shared by the walker, the builder and the command line
//! tool: path manipulation, timestamp conversion, atomic artifact output and
//! human readable formatting.

use crate::error::{Result, TreesumError};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::trace;

/// Make a path relative to a base directory
///
/// Tries a lexical strip first so symlinked paths keep their link location,
/// and only falls back to canonicalizing both sides when that fails.
///
/// # Errors
///
/// - [`TreesumError::Io`] if canonicalization fails
/// - [`TreesumError::Walk`] if `path` is not below `base`
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| TreesumError::walk(path, format!("not below scan root {:?}", base_canon)))
}

/// Convert a filesystem timestamp to UTC, keeping nanosecond precision
pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Raw bytes of a symlink's target path
///
/// These bytes identify a symlink recorded as a link; two links with the
/// same target text share a digest.
pub fn read_link_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    let target = fs::read_link(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        Ok(target.as_os_str().as_bytes().to_vec())
    }
    #[cfg(not(unix))]
    {
        Ok(target.to_string_lossy().replace('\\', "/").into_bytes())
    }
}

/// Output file that only appears at its destination once committed
///
/// Content goes to a temporary file in the destination directory. Dropping
/// an `AtomicFile` without calling [`AtomicFile::commit`] deletes the
/// temporary file, so an interrupted write never leaves anything that looks
/// like a finished artifact.
pub struct AtomicFile {
    dest: PathBuf,
    writer: BufWriter<NamedTempFile>,
}

impl AtomicFile {
    /// Create a temporary file next to `dest`
    pub fn create(dest: &Path) -> Result<Self> {
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = NamedTempFile::new_in(&dir)?;
        trace!("Staging {:?} at {:?}", dest, temp.path());
        Ok(Self {
            dest: dest.to_path_buf(),
            writer: BufWriter::new(temp),
        })
    }

    /// Flush, sync and atomically rename into place
    pub fn commit(self) -> Result<()> {
        let temp = self
            .writer
            .into_inner()
            .map_err(|e| TreesumError::Io(e.into_error()))?;
        temp.as_file().sync_all()?;
        temp.persist(&self.dest).map_err(|e| TreesumError::Io(e.error))?;
        trace!("Committed {:?}", self.dest);
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Format bytes in human-readable form using binary units
///
/// ```rust,ignore
/// assert_eq!(format_bytes(1023), "1023 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Create a symlink (cross-platform)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}
