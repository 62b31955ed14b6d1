//! Directory walking
//!
//! [`FsWalker`] enumerates the files below a scan root as a lazy stream of
//! [`WalkEntry`] values. Directories themselves are not emitted.
//!
//! ## Cycles
//!
//! When links are followed, `walkdir` keeps the identities of the
//! directories on the current path and reports a link back to one of them
//! as an error instead of descending. Each such loop surfaces as a single
//! [`TreesumError::Walk`] item, so the stream stays finite.
//!
//! ## Entry kinds
//!
//! Without link following, symlinks are delivered as
//! [`EntryKind::Symlink`] with the size of the link itself. With link
//! following, targets are delivered as whatever they resolve to and a
//! dangling link becomes a walk error.

use crate::error::{Result, TreesumError};
use crate::types::{EntryKind, WalkEntry};
use crate::utils;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Lazy filesystem walker
pub struct FsWalker {
    root: PathBuf,
    inner: walkdir::IntoIter,
    exclude: GlobSet,
}

impl FsWalker {
    /// Create a walker over `root` with the given options
    ///
    /// # Arguments
    ///
    /// * `root` - Directory to walk
    /// * `follow_symlinks` - Resolve symlinks instead of reporting them
    /// * `same_file_system` - Stay on the file system of `root`
    /// * `exclude` - Glob patterns matched against the path relative to `root`
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Config`] if a pattern does not parse
    pub fn new(
        root: &Path,
        follow_symlinks: bool,
        same_file_system: bool,
        exclude: &[String],
    ) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude {
            let glob = Glob::new(pattern).map_err(|e| {
                TreesumError::config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| TreesumError::config(format!("invalid exclude patterns: {}", e)))?;

        let inner = WalkDir::new(root)
            .follow_links(follow_symlinks)
            .same_file_system(same_file_system)
            .into_iter();

        debug!(
            "Walking {:?} (follow_symlinks={}, {} exclude patterns)",
            root,
            follow_symlinks,
            exclude.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            inner,
            exclude,
        })
    }

    /// Root directory of this walk
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn to_entry(&self, entry: walkdir::DirEntry) -> Result<WalkEntry> {
        let path = entry.path().to_path_buf();
        let relative = utils::make_relative(&path, &self.root)?;
        let metadata = entry
            .metadata()
            .map_err(|e| TreesumError::walk(&path, e.to_string()))?;
        let modified = metadata
            .modified()
            .map_err(|e| TreesumError::walk(&path, format!("no modification time: {}", e)))?;

        let file_type = entry.file_type();
        let kind = if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else {
            EntryKind::Special
        };

        Ok(WalkEntry {
            path,
            relative,
            size: metadata.len(),
            modified: utils::system_time_to_utc(modified),
            kind,
        })
    }
}

impl Iterator for FsWalker {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    // A root that cannot be read aborts the walk
                    return Some(Err(TreesumError::config(format!(
                        "cannot walk scan root {:?}: {}",
                        self.root, err
                    ))));
                }
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    let message = match err.loop_ancestor() {
                        Some(ancestor) => format!("symlink loop back to {:?}", ancestor),
                        None => err.to_string(),
                    };
                    return Some(Err(TreesumError::walk(path, message)));
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            if !self.exclude.is_empty() {
                if let Ok(relative) = entry.path().strip_prefix(&self.root) {
                    if self.exclude.is_match(relative) {
                        trace!("Excluded {:?}", relative);
                        if entry.file_type().is_dir() {
                            self.inner.skip_current_dir();
                        }
                        continue;
                    }
                }
            }

            if entry.file_type().is_dir() {
                continue;
            }

            return Some(self.to_entry(entry));
        }
    }
}
