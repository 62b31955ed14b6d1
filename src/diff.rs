//! Streaming fingerprint comparison
//!
//! [`diff`] compares two record streams that are already in canonical path
//! order with a single merge-join pass: both cursors advance in lock-step,
//! and the smaller path is classified first.
//!
//! ## Classification
//!
//! | Path is in      | Result                                       |
//! |-----------------|----------------------------------------------|
//! | old only        | [`DiffEntry::Removed`]                       |
//! | new only        | [`DiffEntry::Added`]                         |
//! | both, same kind and content | [`DiffEntry::Unchanged`]         |
//! | both, different digest      | [`DiffEntry::Modified`] / [`ChangeKind::Content`] |
//! | both, different kind        | [`DiffEntry::Modified`] / [`ChangeKind::Kind`]    |
//! | both, either unreadable     | [`DiffEntry::Modified`] / [`ChangeKind::Unknown`] |
//!
//! Size and modification time never decide a classification on their own:
//! the content digest is the identity.
//!
//! ## Resources
//!
//! The stream holds one record per side, so memory is constant and time is
//! linear in the two input lengths. It is single-pass; diffing again means
//! building a new stream from fresh inputs.
//!
//! ## Example
//!
//! ```rust
//! use treesum::diff::{diff, DiffSummary};
//! use treesum::types::Fingerprint;
//!
//! fn count_changes(old: &Fingerprint, new: &Fingerprint) -> treesum::Result<usize> {
//!     let summary = DiffSummary::from_entries(diff(old.record_stream(), new.record_stream()))?;
//!     Ok(summary.changed())
//! }
//! ```

use crate::error::{Result, TreesumError};
use crate::types::{FingerprintHeader, Record, RecordContent, RecordPath};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Why a path present on both sides is reported as modified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Content digests differ
    Content,
    /// The entry changed kind (for example file to symlink)
    Kind,
    /// At least one side is unreadable, so equality is unknown
    Unknown,
}

/// One classified path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiffEntry {
    /// Present only in the new fingerprint
    Added {
        /// New record
        record: Record,
    },
    /// Present only in the old fingerprint
    Removed {
        /// Old record
        record: Record,
    },
    /// Present on both sides with a difference or unknown content
    Modified {
        /// Old record
        old: Record,
        /// New record
        new: Record,
        /// Nature of the change
        change: ChangeKind,
    },
    /// Present on both sides with identical kind and content
    Unchanged {
        /// Path of the entry
        path: RecordPath,
    },
    /// A removed and an added entry with identical content.
    /// Only the rename classifier produces this.
    Moved {
        /// Record at the old location
        from: Record,
        /// Record at the new location
        to: Record,
    },
}

impl DiffEntry {
    /// Path the entry is ordered by (the new location for moves)
    pub fn path(&self) -> &RecordPath {
        match self {
            DiffEntry::Added { record } | DiffEntry::Removed { record } => &record.path,
            DiffEntry::Modified { new, .. } => &new.path,
            DiffEntry::Unchanged { path } => path,
            DiffEntry::Moved { to, .. } => &to.path,
        }
    }

    /// Short status label
    pub fn label(&self) -> &'static str {
        match self {
            DiffEntry::Added { .. } => "added",
            DiffEntry::Removed { .. } => "removed",
            DiffEntry::Modified { .. } => "modified",
            DiffEntry::Unchanged { .. } => "unchanged",
            DiffEntry::Moved { .. } => "moved",
        }
    }

    /// Whether this entry reports a difference
    pub fn is_change(&self) -> bool {
        !matches!(self, DiffEntry::Unchanged { .. })
    }
}

impl fmt::Display for DiffEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffEntry::Moved { from, to } => write!(f, "moved {} -> {}", from.path, to.path),
            DiffEntry::Modified { new, change, .. } => {
                write!(f, "modified {} ({:?})", new.path, change)
            }
            other => write!(f, "{} {}", other.label(), other.path()),
        }
    }
}

/// Classify two records that share a path
pub fn classify(old: Record, new: Record) -> DiffEntry {
    let change = if old.is_unreadable() || new.is_unreadable() {
        Some(ChangeKind::Unknown)
    } else if old.kind != new.kind {
        Some(ChangeKind::Kind)
    } else {
        match (&old.content, &new.content) {
            (RecordContent::Digest(a), RecordContent::Digest(b)) if a == b => None,
            (RecordContent::Absent, RecordContent::Absent) => None,
            _ => Some(ChangeKind::Content),
        }
    };

    match change {
        None => DiffEntry::Unchanged { path: new.path },
        Some(change) => DiffEntry::Modified { old, new, change },
    }
}

/// One input side of the merge-join
struct Cursor<I> {
    input: I,
    head: Option<Record>,
    last: Option<RecordPath>,
    done: bool,
    side: &'static str,
}

impl<I: Iterator<Item = Result<Record>>> Cursor<I> {
    fn new(input: I, side: &'static str) -> Self {
        Self {
            input,
            head: None,
            last: None,
            done: false,
            side,
        }
    }

    /// Make sure `head` holds the next record, validating order
    fn fill(&mut self) -> Result<()> {
        if self.head.is_some() || self.done {
            return Ok(());
        }
        match self.input.next() {
            None => {
                self.done = true;
                Ok(())
            }
            Some(Err(e)) => Err(e),
            Some(Ok(record)) => {
                if let Some(last) = &self.last {
                    if record.path <= *last {
                        return Err(TreesumError::format(format!(
                            "{} stream out of order: '{}' after '{}'",
                            self.side, record.path, last
                        )));
                    }
                }
                self.last = Some(record.path.clone());
                self.head = Some(record);
                Ok(())
            }
        }
    }
}

/// Lazy merge-join over two canonical record streams
///
/// Yields one [`DiffEntry`] per distinct path. An input error or an
/// out-of-order input is yielded once as an error, after which the stream
/// is fused.
pub struct DiffStream<A: Iterator<Item = Result<Record>>, B: Iterator<Item = Result<Record>>> {
    old: Cursor<A>,
    new: Cursor<B>,
    failed: bool,
}

impl<A, B> Iterator for DiffStream<A, B>
where
    A: Iterator<Item = Result<Record>>,
    B: Iterator<Item = Result<Record>>,
{
    type Item = Result<DiffEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.old.fill().and_then(|_| self.new.fill()) {
            self.failed = true;
            return Some(Err(e));
        }

        let order = match (&self.old.head, &self.new.head) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(o), Some(n)) => o.path.cmp(&n.path),
        };

        let entry = match order {
            Ordering::Less => self.old.head.take().map(|record| DiffEntry::Removed { record }),
            Ordering::Greater => self.new.head.take().map(|record| DiffEntry::Added { record }),
            Ordering::Equal => match (self.old.head.take(), self.new.head.take()) {
                (Some(old), Some(new)) => Some(classify(old, new)),
                _ => None,
            },
        };
        entry.map(Ok)
    }
}

/// Check that two fingerprints can be compared record by record
///
/// Digests from different algorithms never match, so diffing such a pair
/// reports every shared file as [`ChangeKind::Content`]. Returns
/// [`TreesumError::Config`] in that case.
pub fn check_comparable(old: &FingerprintHeader, new: &FingerprintHeader) -> Result<()> {
    if old.algorithm != new.algorithm {
        return Err(TreesumError::config(format!(
            "fingerprints use different algorithms ({} vs {})",
            old.algorithm, new.algorithm
        )));
    }
    Ok(())
}

/// Compare two record streams in canonical order
///
/// Records are compared as stored. The streams should come from
/// fingerprints that pass [`check_comparable`]; otherwise every path present
/// on both sides with content is reported as modified.
pub fn diff<A, B>(old: A, new: B) -> DiffStream<A::IntoIter, B::IntoIter>
where
    A: IntoIterator<Item = Result<Record>>,
    B: IntoIterator<Item = Result<Record>>,
{
    DiffStream {
        old: Cursor::new(old.into_iter(), "old"),
        new: Cursor::new(new.into_iter(), "new"),
        failed: false,
    }
}

/// Counts over a stream of diff entries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Added paths
    pub added: usize,
    /// Removed paths
    pub removed: usize,
    /// Modified paths (all qualifiers)
    pub modified: usize,
    /// Modified paths whose content could not be compared
    pub unknown: usize,
    /// Unchanged paths
    pub unchanged: usize,
    /// Moved pairs
    pub moved: usize,
    /// Bytes in added files
    pub bytes_added: u64,
    /// Bytes in removed files
    pub bytes_removed: u64,
}

impl DiffSummary {
    /// Account for one entry
    pub fn record(&mut self, entry: &DiffEntry) {
        match entry {
            DiffEntry::Added { record } => {
                self.added += 1;
                self.bytes_added += record.size;
            }
            DiffEntry::Removed { record } => {
                self.removed += 1;
                self.bytes_removed += record.size;
            }
            DiffEntry::Modified { change, .. } => {
                self.modified += 1;
                if *change == ChangeKind::Unknown {
                    self.unknown += 1;
                }
            }
            DiffEntry::Unchanged { .. } => self.unchanged += 1,
            DiffEntry::Moved { .. } => self.moved += 1,
        }
    }

    /// Drain a stream of entries, stopping at the first error
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<DiffEntry>>,
    {
        let mut summary = Self::default();
        for entry in entries {
            summary.record(&entry?);
        }
        Ok(summary)
    }

    /// Number of entries reporting a difference
    pub fn changed(&self) -> usize {
        self.added + self.removed + self.modified + self.moved
    }

    /// Whether anything differs
    pub fn has_changes(&self) -> bool {
        self.changed() > 0
    }
}

impl fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} removed, {} modified, {} moved, {} unchanged",
            self.added, self.removed, self.modified, self.moved, self.unchanged
        )
    }
}
