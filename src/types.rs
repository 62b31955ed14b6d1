//! Core data types used throughout the treesum library
//!
//! ## Overview
//!
//! The types in this module represent:
//! - **Identity**: [`RecordPath`], [`Record`], [`RecordContent`], [`EntryKind`]
//!   describe one file as of a scan
//! - **Snapshots**: [`Fingerprint`] and [`FingerprintHeader`] describe a whole tree
//! - **Scanning**: [`WalkEntry`], [`ScanWarning`], [`BuildStats`],
//!   [`ProgressInfo`] and [`CancellationToken`] flow through a build
//!
//! ## Canonical order
//!
//! Records are ordered by path component: components are compared bytewise
//! and a shorter path sorts before any path it is a prefix of. This is not
//! plain string order, since `/` must sort before every other byte:
//!
//! ```rust
//! use treesum::types::RecordPath;
//!
//! let nested = RecordPath::parse("a/b").unwrap();
//! let sibling = RecordPath::parse("a-b").unwrap();
//! assert!(nested < sibling);
//! ```

use crate::digest::{ContentDigest, DigestAlgorithm};
use crate::error::{Result, TreesumError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Relative path of a record in canonical form
///
/// Components are separated by `/`, normalized to Unicode NFC, and never
/// empty, `.` or `..`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordPath(String);

impl RecordPath {
    /// Parse a `/`-separated path, normalizing it to NFC
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] for empty paths, absolute paths, or
    ///   empty, `.` or `..` components
    pub fn parse(s: &str) -> Result<Self> {
        let normalized: String = if is_nfc(s) { s.to_string() } else { s.nfc().collect() };
        let path = RecordPath(normalized);
        path.validate()?;
        Ok(path)
    }

    /// Build a canonical path from a path relative to the scan root
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Walk`] if a component is not valid UTF-8 or the
    ///   path escapes the root
    pub fn from_relative(relative: &Path) -> Result<Self> {
        let mut parts: Vec<String> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        TreesumError::walk(relative, "path is not valid UTF-8")
                    })?;
                    parts.push(name.nfc().collect());
                }
                Component::CurDir => {}
                _ => {
                    return Err(TreesumError::walk(
                        relative,
                        "path is not relative to the scan root",
                    ))
                }
            }
        }
        if parts.is_empty() {
            return Err(TreesumError::walk(relative, "empty relative path"));
        }
        Ok(RecordPath(parts.join("/")))
    }

    /// Check the canonical form invariants
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(TreesumError::format("empty record path"));
        }
        if self.0.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(TreesumError::format(format!("non-canonical record path '{}'", self.0)));
        }
        if !is_nfc(&self.0) {
            return Err(TreesumError::format(format!("record path '{}' is not NFC", self.0)));
        }
        Ok(())
    }

    /// The path as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Native path for this record below `root`
    pub fn to_native(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.components());
        path
    }
}

/// Byte used for comparison: the separator sorts before everything else
fn order_key(b: u8) -> u16 {
    if b == b'/' {
        0
    } else {
        u16::from(b) + 1
    }
}

impl Ord for RecordPath {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .bytes()
            .map(order_key)
            .cmp(other.0.bytes().map(order_key))
    }
}

impl PartialOrd for RecordPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// What kind of filesystem object a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file (or a symlink target when links are followed)
    File,
    /// Symbolic link recorded as a link
    Symlink,
    /// Device, socket or pipe
    Special,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryKind::File => "file",
            EntryKind::Symlink => "symlink",
            EntryKind::Special => "special",
        };
        f.write_str(s)
    }
}

/// Content identity of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordContent {
    /// Content digest (for symlinks, the digest of the target path text)
    Digest(ContentDigest),
    /// Hashing failed; the content is unknown
    Unreadable,
    /// No content is tracked for this kind
    Absent,
}

/// One file's identity at scan time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Canonical path relative to the scan root
    pub path: RecordPath,
    /// Size in bytes at scan time
    pub size: u64,
    /// Modification time at scan time
    pub modified: DateTime<Utc>,
    /// Kind of filesystem object
    pub kind: EntryKind,
    /// Content digest or marker
    pub content: RecordContent,
}

impl Record {
    /// Digest, if the content was hashed
    pub fn digest(&self) -> Option<&ContentDigest> {
        match &self.content {
            RecordContent::Digest(d) => Some(d),
            _ => None,
        }
    }

    /// Whether hashing this file failed
    pub fn is_unreadable(&self) -> bool {
        matches!(self.content, RecordContent::Unreadable)
    }
}

/// Optional compression of the artifact body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Records are stored as is
    #[default]
    None,
    /// Records are wrapped in an LZ4 frame
    Lz4,
}

/// Fingerprint metadata stored in the artifact header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintHeader {
    /// Artifact format version
    pub format_version: u16,
    /// Digest function for record contents and the trailer
    pub algorithm: DigestAlgorithm,
    /// Description of the scan root (informational)
    pub root: String,
    /// When the fingerprint was built
    pub created_at: DateTime<Utc>,
    /// Hashing block size used by the build
    pub block_size: u32,
    /// Body compression
    pub compression: Compression,
    /// Whether an integrity trailer follows the records
    pub trailer: bool,
}

impl FingerprintHeader {
    /// Header for a new fingerprint of `root` with default artifact options
    pub fn new(root: impl Into<String>, algorithm: DigestAlgorithm) -> Self {
        Self {
            format_version: crate::codec::FORMAT_VERSION,
            algorithm,
            root: root.into(),
            created_at: Utc::now(),
            block_size: crate::digest::DEFAULT_BLOCK_SIZE as u32,
            compression: Compression::None,
            trailer: true,
        }
    }
}

/// An ordered, immutable snapshot of a tree's identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Header metadata
    pub header: FingerprintHeader,
    /// Records in canonical path order
    pub records: Vec<Record>,
}

impl Fingerprint {
    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the fingerprint has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total size of all recorded files
    pub fn total_size(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    /// Find a record by path
    pub fn get(&self, path: &RecordPath) -> Option<&Record> {
        self.records
            .binary_search_by(|r| r.path.cmp(path))
            .ok()
            .map(|i| &self.records[i])
    }

    /// Records as an owned stream of `Result`s, the shape the diff engine consumes
    pub fn record_stream(&self) -> impl Iterator<Item = Result<Record>> + '_ {
        self.records.iter().cloned().map(Ok)
    }
}

/// One entry delivered by the walker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute path used for reading
    pub path: PathBuf,
    /// Path relative to the scan root
    pub relative: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Modification time
    pub modified: DateTime<Utc>,
    /// Object kind
    pub kind: EntryKind,
}

/// Category of a non-fatal scan problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    /// Entry could not be enumerated and was skipped
    Walk,
    /// File could not be hashed and was recorded as unreadable
    Read,
    /// Two entries mapped to the same canonical path; the later one was dropped
    DuplicatePath,
}

/// A per-entry problem reported next to a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    /// Affected path
    pub path: PathBuf,
    /// Category
    pub kind: WarningKind,
    /// Description
    pub message: String,
}

impl ScanWarning {
    /// Convert a recoverable error into a warning
    pub fn from_error(err: &TreesumError) -> Self {
        match err {
            TreesumError::Read { path, message } => Self {
                path: path.clone(),
                kind: WarningKind::Read,
                message: message.clone(),
            },
            TreesumError::Walk { path, message } => Self {
                path: path.clone(),
                kind: WarningKind::Walk,
                message: message.clone(),
            },
            other => Self {
                path: PathBuf::new(),
                kind: WarningKind::Walk,
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} ({:?})", self.path, self.message, self.kind)
    }
}

/// Counters collected during a build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStats {
    /// Entries delivered by the walker, including failures
    pub entries_seen: usize,
    /// Records in the resulting fingerprint
    pub records: usize,
    /// Files whose content was hashed
    pub files_hashed: usize,
    /// Files whose digest was copied from the previous fingerprint
    pub files_reused: usize,
    /// Files recorded as unreadable
    pub files_unreadable: usize,
    /// Entries skipped by walk errors, kind policies or duplicates
    pub entries_skipped: usize,
    /// Bytes read while hashing
    pub bytes_hashed: u64,
    /// Wall-clock duration of the build
    pub duration: Duration,
}

/// Progress information for long-running operations
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Operation being performed
    pub operation: String,
    /// Current item being processed
    pub current_item: Option<String>,
    /// Items processed so far
    pub processed: usize,
    /// Total items to process (if known)
    pub total: Option<usize>,
    /// Bytes processed so far
    pub bytes_processed: u64,
    /// Total bytes to process (if known)
    pub total_bytes: Option<u64>,
}

impl ProgressInfo {
    /// Get progress as a percentage (0-100)
    pub fn percentage(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Cooperative cancellation flag shared between a caller and a running build
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}
