//! Integration tests for treesum
//!
//! Exercises complete scan, rescan, diff and verification flows against
//! real directory trees generated on disk.

use ::treesum::*;
use filetime::FileTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::info;

/// A scratch tree plus a separate directory for artifacts
pub struct TreeHarness {
    pub tree: TempDir,
    pub artifacts: TempDir,
    pub generator: FileGenerator,
}

impl TreeHarness {
    pub fn new() -> Self {
        Self {
            tree: TempDir::new().unwrap(),
            artifacts: TempDir::new().unwrap(),
            generator: FileGenerator::new(42),
        }
    }

    pub fn root(&self) -> &Path {
        self.tree.path()
    }

    pub fn artifact(&self, name: &str) -> PathBuf {
        self.artifacts.path().join(name)
    }

    /// Populate the tree with `dirs` directories of `files_per_dir` files
    pub fn generate_tree(&mut self, dirs: usize, files_per_dir: usize) -> anyhow::Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        for d in 0..dirs {
            let dir = PathBuf::from(format!("dir_{:02}", d));
            fs::create_dir_all(self.tree.path().join(&dir))?;
            for f in 0..files_per_dir {
                let relative = dir.join(format!("file_{:03}.txt", f));
                let content = if f % 5 == 0 {
                    self.generator.generate_binary_content(2048)
                } else {
                    self.generator.generate_file_content(16..4096)
                };
                fs::write(self.tree.path().join(&relative), content)?;
                created.push(relative);
            }
        }
        info!("Generated {} files", created.len());
        Ok(created)
    }

    /// Write `content` and pin the mtime so metadata comparisons are stable
    pub fn write_pinned(&self, relative: &str, content: &[u8], mtime_secs: i64) {
        let path = self.tree.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    pub fn scan(&self, name: &str, config: BuildConfig, previous: Option<&Path>) -> (BuildOutcome, PathBuf) {
        let dest = self.artifact(name);
        let (outcome, _) = FingerprintBuilder::new(self.root(), config)
            .unwrap()
            .build_to_file(&dest, previous)
            .unwrap();
        (outcome, dest)
    }
}

/// Deterministic pseudo-random file contents
pub struct FileGenerator {
    rng: StdRng,
}

impl FileGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Text-like content of a random length in `size_range`
    pub fn generate_file_content(&mut self, size_range: std::ops::Range<usize>) -> Vec<u8> {
        let size = self.rng.random_range(size_range);
        let words = ["alpha", "beta", "gamma", "delta", "tree", "sum", "block", "digest"];
        let mut content = Vec::with_capacity(size);
        while content.len() < size {
            let word = words[self.rng.random_range(0..words.len())];
            content.extend_from_slice(word.as_bytes());
            content.push(b' ');
        }
        content.truncate(size);
        content
    }

    pub fn generate_binary_content(&mut self, size: usize) -> Vec<u8> {
        let mut content = vec![0u8; size];
        self.rng.fill(&mut content[..]);
        content
    }
}

/// Diff two artifacts and render each change with its Display form
fn diff_files(old: &Path, new: &Path, renames: Option<RenameConfig>) -> Vec<String> {
    let old = FingerprintFile::open_verified(old).unwrap();
    let new = FingerprintFile::open_verified(new).unwrap();
    let stream = diff(old.records().unwrap(), new.records().unwrap());
    let entries: Vec<DiffEntry> = match renames {
        Some(config) => classify_renames(stream, config).unwrap(),
        None => stream.collect::<Result<_>>().unwrap(),
    };
    entries
        .into_iter()
        .filter(DiffEntry::is_change)
        .map(|e| e.to_string())
        .collect()
}

#[test]
fn test_scan_modify_rescan_diff() {
    let mut harness = TreeHarness::new();
    let files = harness.generate_tree(4, 10).unwrap();
    let (first, monday) = harness.scan("monday.tsum", BuildConfig::default(), None);
    assert_eq!(first.fingerprint.len(), files.len());

    fs::write(harness.root().join("dir_00/file_001.txt"), b"rewritten").unwrap();
    fs::remove_file(harness.root().join("dir_01/file_002.txt")).unwrap();
    fs::write(harness.root().join("dir_03/new.txt"), b"fresh").unwrap();

    let (_, tuesday) = harness.scan("tuesday.tsum", BuildConfig::default(), None);
    assert_eq!(
        diff_files(&monday, &tuesday, None),
        vec![
            "modified dir_00/file_001.txt (Content)",
            "removed dir_01/file_002.txt",
            "added dir_03/new.txt",
        ]
    );
}

#[test]
fn test_identical_trees_share_tree_digest() {
    let mut harness = TreeHarness::new();
    harness.generate_tree(3, 8).unwrap();

    let copy = TempDir::new().unwrap();
    for entry in walkdir_files(harness.root()) {
        let relative = entry.strip_prefix(harness.root()).unwrap();
        let target = copy.path().join(relative);
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::copy(&entry, &target).unwrap();
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&entry).unwrap());
        filetime::set_file_mtime(&target, mtime).unwrap();
    }

    let config = BuildConfig::default().with_workers(3);
    let (_, a) = FingerprintBuilder::new(harness.root(), config.clone())
        .unwrap()
        .build_to_file(&harness.artifact("a.tsum"), None)
        .unwrap();
    let (_, b) = FingerprintBuilder::new(copy.path(), config)
        .unwrap()
        .build_to_file(&harness.artifact("b.tsum"), None)
        .unwrap();

    assert_eq!(a.tree_digest, b.tree_digest);
    assert_ne!(a.artifact_digest, b.artifact_digest, "headers name different roots");
}

fn walkdir_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out
}

#[test]
fn test_worker_count_does_not_change_result() {
    let mut harness = TreeHarness::new();
    harness.generate_tree(5, 20).unwrap();

    let digests: Vec<_> = [1, 2, 7, 16]
        .into_iter()
        .map(|workers| {
            let config = BuildConfig::default().with_workers(workers).with_queue_depth(1);
            let outcome = FingerprintBuilder::new(harness.root(), config).unwrap().build().unwrap();
            codec::tree_digest(&outcome.fingerprint).unwrap()
        })
        .collect();

    assert!(digests.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_rescan_reuses_digests_under_trust_metadata() {
    let harness = TreeHarness::new();
    harness.write_pinned("stable.txt", b"stable content", 1_600_000_000);
    harness.write_pinned("edited.txt", b"version one", 1_600_000_000);
    harness.write_pinned("sub/other.bin", &[1, 2, 3, 4], 1_600_000_000);

    let trusting = BuildConfig::default().with_trust(TrustPolicy::TrustMetadata);
    let (first, monday) = harness.scan("monday.tsum", trusting.clone(), None);
    assert_eq!(first.stats.files_hashed, 3);

    harness.write_pinned("edited.txt", b"version two!", 1_600_000_100);
    let (second, tuesday) = harness.scan("tuesday.tsum", trusting, Some(&monday));

    assert_eq!(second.stats.files_reused, 2);
    assert_eq!(second.stats.files_hashed, 1);
    assert_eq!(
        diff_files(&monday, &tuesday, None),
        vec!["modified edited.txt (Content)"]
    );
}

#[test]
fn test_trust_metadata_misses_content_change_with_same_metadata() {
    let harness = TreeHarness::new();
    harness.write_pinned("sneaky.txt", b"AAAA", 1_600_000_000);

    let trusting = BuildConfig::default().with_trust(TrustPolicy::TrustMetadata);
    let (_, before) = harness.scan("before.tsum", trusting.clone(), None);

    // Same size, same mtime, different bytes
    harness.write_pinned("sneaky.txt", b"BBBB", 1_600_000_000);

    let (reused, trusted) = harness.scan("trusted.tsum", trusting, Some(&before));
    assert_eq!(reused.stats.files_reused, 1);
    assert!(diff_files(&before, &trusted, None).is_empty());

    let (rehashed, strict) = harness.scan("strict.tsum", BuildConfig::default(), Some(&before));
    assert_eq!(rehashed.stats.files_reused, 0);
    assert_eq!(
        diff_files(&before, &strict, None),
        vec!["modified sneaky.txt (Content)"]
    );
}

#[test]
fn test_previous_with_other_algorithm_is_not_reused() {
    let harness = TreeHarness::new();
    harness.write_pinned("a.txt", b"hello", 1_600_000_000);

    let (_, sha) = harness.scan("sha.tsum", BuildConfig::default(), None);
    let blake = BuildConfig::default()
        .with_algorithm(DigestAlgorithm::Blake3)
        .with_trust(TrustPolicy::TrustMetadata);
    let (outcome, blake_path) = harness.scan("blake.tsum", blake, Some(&sha));

    assert_eq!(outcome.stats.files_reused, 0);
    assert_eq!(
        outcome.fingerprint.records[0].digest(),
        Some(&DigestAlgorithm::Blake3.digest(b"hello"))
    );
    assert_eq!(
        diff_files(&sha, &blake_path, None),
        vec!["modified a.txt (Content)"]
    );
}

#[test]
fn test_rename_detection_end_to_end() {
    let harness = TreeHarness::new();
    harness.write_pinned("docs/report.pdf", b"%PDF pretend", 1_600_000_000);
    harness.write_pinned("docs/empty.txt", b"", 1_600_000_000);
    harness.write_pinned("keep.txt", b"keep", 1_600_000_000);
    let (_, before) = harness.scan("before.tsum", BuildConfig::default(), None);

    fs::create_dir(harness.root().join("archive")).unwrap();
    fs::rename(
        harness.root().join("docs/report.pdf"),
        harness.root().join("archive/report-2024.pdf"),
    )
    .unwrap();
    fs::rename(
        harness.root().join("docs/empty.txt"),
        harness.root().join("archive/empty.txt"),
    )
    .unwrap();
    let (_, after) = harness.scan("after.tsum", BuildConfig::default(), None);

    assert_eq!(
        diff_files(&before, &after, Some(RenameConfig { min_size: 1 })),
        vec![
            "added archive/empty.txt",
            "moved docs/report.pdf -> archive/report-2024.pdf",
            "removed docs/empty.txt",
        ]
    );
    assert_eq!(diff_files(&before, &after, None).len(), 4);
}

#[test]
fn test_compressed_and_trailerless_artifacts() {
    let mut harness = TreeHarness::new();
    harness.generate_tree(2, 15).unwrap();

    let (plain, plain_path) = harness.scan("plain.tsum", BuildConfig::default(), None);
    let (_, lz4_path) = harness.scan(
        "lz4.tsum",
        BuildConfig::default().with_compression(Compression::Lz4),
        None,
    );
    let (_, bare_path) = harness.scan("bare.tsum", BuildConfig::default().with_trailer(false), None);

    let lz4 = FingerprintFile::open_verified(&lz4_path).unwrap();
    assert_eq!(lz4.header().compression, Compression::Lz4);
    assert!(lz4.summary().trailer_verified);

    let bare = FingerprintFile::open_verified(&bare_path).unwrap();
    assert!(!bare.summary().trailer_verified);

    let plain_summary = verify_artifact(&plain_path).unwrap();
    assert_eq!(plain_summary.tree_digest, lz4.summary().tree_digest);
    assert_eq!(plain_summary.tree_digest, bare.summary().tree_digest);

    assert_eq!(read_fingerprint(&lz4_path).unwrap().records, plain.fingerprint.records);
    assert!(diff_files(&plain_path, &lz4_path, None).is_empty());
}

#[test]
fn test_damaged_artifacts_are_rejected() {
    let mut harness = TreeHarness::new();
    harness.generate_tree(2, 5).unwrap();
    let (_, path) = harness.scan("fp.tsum", BuildConfig::default(), None);
    let original = fs::read(&path).unwrap();

    let truncated = harness.artifact("truncated.tsum");
    fs::write(&truncated, &original[..original.len() - 10]).unwrap();
    let err = FingerprintFile::open_verified(&truncated).unwrap_err();
    assert!(matches!(err, TreesumError::Integrity(_)), "{:?}", err);

    let flipped = harness.artifact("flipped.tsum");
    let mut bytes = original.clone();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&flipped, &bytes).unwrap();
    assert!(FingerprintFile::open_verified(&flipped).unwrap_err().is_corruption());

    // A damaged previous fingerprint aborts the rescan instead of seeding it
    let result = FingerprintBuilder::new(
        harness.root(),
        BuildConfig::default().with_trust(TrustPolicy::TrustMetadata),
    )
    .unwrap()
    .build_to_file(&harness.artifact("next.tsum"), Some(&truncated));
    assert!(result.unwrap_err().is_corruption());
    assert!(!harness.artifact("next.tsum").exists());
}

#[test]
fn test_verify_live_tree() {
    let mut harness = TreeHarness::new();
    harness.generate_tree(3, 6).unwrap();
    let (_, fp) = harness.scan("fp.tsum", BuildConfig::default(), None);

    let report = verify_tree(harness.root(), &fp, BuildConfig::default()).unwrap();
    assert!(report.is_clean(), "{}", report.summary());
    assert_eq!(report.files_valid, 18);

    fs::write(harness.root().join("dir_02/file_000.txt"), b"bit rot").unwrap();
    let report = verify_tree(harness.root(), &fp, BuildConfig::default()).unwrap();
    assert_eq!(report.mismatched, vec!["dir_02/file_000.txt".to_string()]);
    assert_eq!(report.files_valid, 17);
}

#[test]
fn test_diff_summary_counts_bytes() {
    let harness = TreeHarness::new();
    harness.write_pinned("a", &[0u8; 100], 1_600_000_000);
    harness.write_pinned("b", &[1u8; 50], 1_600_000_000);
    let (old, _) = harness.scan("old.tsum", BuildConfig::default(), None);

    fs::remove_file(harness.root().join("a")).unwrap();
    harness.write_pinned("c", &[2u8; 30], 1_600_000_000);
    let (new, _) = harness.scan("new.tsum", BuildConfig::default(), None);

    let summary = DiffSummary::from_entries(diff(
        old.fingerprint.record_stream(),
        new.fingerprint.record_stream(),
    ))
    .unwrap();
    assert_eq!(summary.added, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.bytes_added, 30);
    assert_eq!(summary.bytes_removed, 100);
    assert_eq!(summary.to_string(), "1 added, 1 removed, 0 modified, 0 moved, 1 unchanged");
}

#[test]
fn test_many_small_files_roundtrip_through_disk() {
    let mut harness = TreeHarness::new();
    let mut expected = BTreeMap::new();
    for i in 0..300 {
        let content = harness.generator.generate_file_content(1..64);
        let name = format!("f{:04}", i);
        fs::write(harness.root().join(&name), &content).unwrap();
        expected.insert(name, DigestAlgorithm::Sha256.digest(&content));
    }

    let (outcome, path) = harness.scan("many.tsum", BuildConfig::default().with_workers(4), None);
    assert_eq!(outcome.stats.files_hashed, 300);

    let loaded = read_fingerprint(&path).unwrap();
    let actual: BTreeMap<_, _> = loaded
        .records
        .iter()
        .map(|r| (r.path.as_str().to_string(), *r.digest().unwrap()))
        .collect();
    assert_eq!(actual, expected);
}
