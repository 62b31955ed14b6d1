//! Property-based testing for treesum
//!
//! Uses proptest to check ordering, determinism and diff invariants over
//! randomly generated trees and record sets.

use ::treesum::*;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Relative file paths that never collide with a directory name
fn path_strategy() -> impl Strategy<Value = String> {
    let dirs = prop::collection::vec("d[0-9]", 0..=3);
    let file = prop_oneof![
        "f[0-9]{1,2}\\.txt",
        "[a-z]{1,6}",
        "[a-z]{1,4}-[a-z]{1,4}",
    ];
    (dirs, file).prop_map(|(dirs, file)| {
        let mut parts = dirs;
        parts.push(file);
        parts.join("/")
    })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        "[a-zA-Z0-9 \n]{0,200}".prop_map(|s| s.into_bytes()),
        prop::collection::vec(any::<u8>(), 0..2000),
        (any::<u8>(), 1..5000usize).prop_map(|(byte, count)| vec![byte; count]),
    ]
}

fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..25)
}

fn materialize(root: &Path, tree: &BTreeMap<String, Vec<u8>>) {
    for (path, content) in tree {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(&full, content).unwrap();
    }
}

/// In-memory records for a tree, in canonical order
fn records(tree: &BTreeMap<String, Vec<u8>>) -> Vec<Record> {
    let modified = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let mut out: Vec<Record> = tree
        .iter()
        .map(|(path, content)| Record {
            path: RecordPath::parse(path).unwrap(),
            size: content.len() as u64,
            modified,
            kind: EntryKind::File,
            content: RecordContent::Digest(DigestAlgorithm::Sha256.digest(content)),
        })
        .collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

fn diff_records(old: &[Record], new: &[Record]) -> Vec<DiffEntry> {
    diff(old.iter().cloned().map(Ok), new.iter().cloned().map(Ok))
        .collect::<Result<Vec<_>>>()
        .unwrap()
}

/// Paths of a diff grouped by outcome
#[derive(Debug, Default)]
struct PathsByLabel {
    added: BTreeSet<RecordPath>,
    removed: BTreeSet<RecordPath>,
    modified: BTreeMap<RecordPath, ChangeKind>,
    unchanged: BTreeSet<RecordPath>,
}

fn by_label(entries: &[DiffEntry]) -> PathsByLabel {
    let mut paths = PathsByLabel::default();
    for entry in entries {
        let path = entry.path().clone();
        match entry {
            DiffEntry::Added { .. } => {
                paths.added.insert(path);
            }
            DiffEntry::Removed { .. } => {
                paths.removed.insert(path);
            }
            DiffEntry::Modified { change, .. } => {
                paths.modified.insert(path, *change);
            }
            DiffEntry::Unchanged { .. } => {
                paths.unchanged.insert(path);
            }
            DiffEntry::Moved { .. } => unreachable!("plain diff never pairs moves"),
        }
    }
    paths
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Two builds of the same tree yield identical records
    #[test]
    fn build_is_deterministic(tree in tree_strategy(), workers in 1..6usize) {
        let temp_dir = TempDir::new().unwrap();
        materialize(temp_dir.path(), &tree);

        let one = FingerprintBuilder::new(temp_dir.path(), BuildConfig::default().with_workers(1))
            .unwrap()
            .build()
            .unwrap();
        let many = FingerprintBuilder::new(temp_dir.path(), BuildConfig::default().with_workers(workers))
            .unwrap()
            .build()
            .unwrap();

        prop_assert_eq!(&one.fingerprint.records, &many.fingerprint.records);
        prop_assert_eq!(one.fingerprint.len(), tree.len());
        prop_assert!(one
            .fingerprint
            .records
            .windows(2)
            .all(|w| w[0].path < w[1].path));
    }

    /// Built records match the in-memory digests of the same tree
    #[test]
    fn build_matches_content(tree in tree_strategy()) {
        let temp_dir = TempDir::new().unwrap();
        materialize(temp_dir.path(), &tree);

        let outcome = FingerprintBuilder::new(temp_dir.path(), BuildConfig::default().with_block_size(4096))
            .unwrap()
            .build()
            .unwrap();
        let expected = records(&tree);

        prop_assert_eq!(outcome.fingerprint.len(), expected.len());
        for (built, want) in outcome.fingerprint.records.iter().zip(&expected) {
            prop_assert_eq!(&built.path, &want.path);
            prop_assert_eq!(built.size, want.size);
            prop_assert_eq!(&built.content, &want.content);
        }
    }

    /// A fingerprint compared with itself reports no change
    #[test]
    fn self_diff_is_unchanged(tree in tree_strategy()) {
        let recs = records(&tree);
        let entries = diff_records(&recs, &recs);
        prop_assert_eq!(entries.len(), recs.len());
        prop_assert!(entries.iter().all(|e| matches!(e, DiffEntry::Unchanged { .. })), "expected all entries Unchanged");
    }

    /// Swapping the inputs swaps added and removed, path for path
    #[test]
    fn diff_is_symmetric(a in tree_strategy(), b in tree_strategy()) {
        let (ra, rb) = (records(&a), records(&b));
        let forward = by_label(&diff_records(&ra, &rb));
        let backward = by_label(&diff_records(&rb, &ra));

        prop_assert_eq!(&forward.added, &backward.removed);
        prop_assert_eq!(&forward.removed, &backward.added);
        prop_assert_eq!(&forward.modified, &backward.modified);
        prop_assert_eq!(&forward.unchanged, &backward.unchanged);
    }

    /// Every path of either side is reported exactly once, in order
    #[test]
    fn diff_covers_union_of_paths(a in tree_strategy(), b in tree_strategy()) {
        let (ra, rb) = (records(&a), records(&b));
        let entries = diff_records(&ra, &rb);

        let mut union: Vec<RecordPath> = ra.iter().chain(&rb).map(|r| r.path.clone()).collect();
        union.sort();
        union.dedup();
        let reported: Vec<RecordPath> = entries.iter().map(|e| e.path().clone()).collect();
        prop_assert_eq!(reported, union);
    }

    /// Rename pairing never loses or invents paths
    #[test]
    fn renames_preserve_paths(a in tree_strategy(), b in tree_strategy()) {
        let (ra, rb) = (records(&a), records(&b));
        let plain = DiffSummary::from_entries(diff_records(&ra, &rb).into_iter().map(Ok)).unwrap();
        let paired = classify_renames(
            diff_records(&ra, &rb).into_iter().map(Ok),
            RenameConfig::default(),
        )
        .unwrap();
        let summary = DiffSummary::from_entries(paired.iter().cloned().map(Ok)).unwrap();

        prop_assert_eq!(summary.added + summary.moved, plain.added);
        prop_assert_eq!(summary.removed + summary.moved, plain.removed);
        prop_assert_eq!(summary.unchanged, plain.unchanged);
        prop_assert!(paired.windows(2).all(|w| w[0].path() <= w[1].path()));
    }

    /// Artifacts survive encoding for every option combination
    #[test]
    fn artifact_round_trip(
        tree in tree_strategy(),
        blake in any::<bool>(),
        lz4 in any::<bool>(),
        trailer in any::<bool>(),
    ) {
        let algorithm = if blake { DigestAlgorithm::Blake3 } else { DigestAlgorithm::Sha256 };
        let mut header = FingerprintHeader::new("/prop", algorithm);
        header.compression = if lz4 { Compression::Lz4 } else { Compression::None };
        header.trailer = trailer;
        let fingerprint = Fingerprint { header, records: records(&tree) };

        let bytes = encode(&fingerprint).unwrap();
        let decoded = decode(&bytes).unwrap();
        prop_assert_eq!(&decoded.records, &fingerprint.records);
        prop_assert_eq!(decoded.header.algorithm, algorithm);
        prop_assert_eq!(decoded.header.trailer, trailer);
    }
}
