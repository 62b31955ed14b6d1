//! Rename and move detection
//!
//! A post-pass over a diff stream. Removed and added entries of the same
//! kind that carry the same content digest are paired into
//! [`DiffEntry::Moved`]. A symlink never pairs with a regular file, even when
//! its target text hashes to the file's content.
//!
//! Only added and removed entries with a digest are retained, so memory is
//! bounded by the change set rather than the tree. Every other entry is
//! handed straight back to the caller by [`RenameClassifier::observe`].
//!
//! ## Ties
//!
//! When several removed or added paths share a digest (duplicate content),
//! both sides are taken in canonical path order and paired smallest with
//! smallest. Whatever is left over on either side stays a plain addition or
//! removal.

use crate::diff::DiffEntry;
use crate::digest::ContentDigest;
use crate::error::Result;
use crate::types::{EntryKind, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Options for rename detection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameConfig {
    /// Files smaller than this are never paired. Empty files all share a
    /// digest, which makes pairing them meaningless.
    pub min_size: u64,
}

type PairKey = (EntryKind, ContentDigest);

/// Accumulates added/removed entries and pairs them at the end
#[derive(Debug, Default)]
pub struct RenameClassifier {
    config: RenameConfig,
    removed: BTreeMap<PairKey, Vec<Record>>,
    added: BTreeMap<PairKey, Vec<Record>>,
    retained: usize,
}

impl RenameClassifier {
    /// Create a classifier
    pub fn new(config: RenameConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Number of entries currently held back for pairing
    pub fn retained(&self) -> usize {
        self.retained
    }

    /// Feed one diff entry
    ///
    /// Returns the entry unchanged unless it is a pairing candidate, in which
    /// case it is held until [`RenameClassifier::finish`].
    pub fn observe(&mut self, entry: DiffEntry) -> Option<DiffEntry> {
        match entry {
            DiffEntry::Added { record } => match self.pair_key(&record) {
                Some(key) => {
                    self.added.entry(key).or_default().push(record);
                    self.retained += 1;
                    None
                }
                None => Some(DiffEntry::Added { record }),
            },
            DiffEntry::Removed { record } => match self.pair_key(&record) {
                Some(key) => {
                    self.removed.entry(key).or_default().push(record);
                    self.retained += 1;
                    None
                }
                None => Some(DiffEntry::Removed { record }),
            },
            other => Some(other),
        }
    }

    /// Pair the retained entries
    ///
    /// The result is sorted by [`DiffEntry::path`], which for moves is the
    /// new location.
    pub fn finish(mut self) -> Vec<DiffEntry> {
        let mut out = Vec::with_capacity(self.retained);
        let mut moved = 0usize;

        for (key, mut removed) in std::mem::take(&mut self.removed) {
            let mut added = self.added.remove(&key).unwrap_or_default();
            removed.sort_by(|a, b| a.path.cmp(&b.path));
            added.sort_by(|a, b| a.path.cmp(&b.path));

            let pairs = removed.len().min(added.len());
            let extra_removed = removed.split_off(pairs);
            let extra_added = added.split_off(pairs);

            for (from, to) in removed.into_iter().zip(added) {
                out.push(DiffEntry::Moved { from, to });
                moved += 1;
            }
            out.extend(extra_removed.into_iter().map(|record| DiffEntry::Removed { record }));
            out.extend(extra_added.into_iter().map(|record| DiffEntry::Added { record }));
        }

        for (_, added) in self.added {
            out.extend(added.into_iter().map(|record| DiffEntry::Added { record }));
        }

        out.sort_by(|a, b| a.path().cmp(b.path()));
        debug!("Rename pass: {} moves among {} candidates", moved, self.retained);
        out
    }

    fn pair_key(&self, record: &Record) -> Option<PairKey> {
        if record.size < self.config.min_size {
            return None;
        }
        record.digest().map(|digest| (record.kind, *digest))
    }
}

/// Run a whole diff stream through rename detection
///
/// Returns every entry, moves included, in canonical path order.
pub fn classify_renames<I>(entries: I, config: RenameConfig) -> Result<Vec<DiffEntry>>
where
    I: IntoIterator<Item = Result<DiffEntry>>,
{
    let mut classifier = RenameClassifier::new(config);
    let mut out = Vec::new();
    for entry in entries {
        if let Some(entry) = classifier.observe(entry?) {
            out.push(entry);
        }
    }
    out.extend(classifier.finish());
    out.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(out)
}
