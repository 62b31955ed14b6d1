//! Main test module for treesum
//!
//! This module includes all test suites:
//! - Integration tests for scan, rescan, diff and verification flows
//! - Property-based tests for ordering and diff invariants
//! - Edge cases for unusual trees and artifacts

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::treesum::*;
    use std::fs;
    use tempfile::TempDir;

    fn build(root: &std::path::Path) -> BuildOutcome {
        FingerprintBuilder::new(root, BuildConfig::default().with_workers(2))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("only/empty/dirs")).unwrap();

        let outcome = build(temp_dir.path());
        assert!(outcome.fingerprint.is_empty());
        assert!(outcome.warnings.is_empty());

        let bytes = encode(&outcome.fingerprint).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.records, outcome.fingerprint.records);

        let summary = DiffSummary::from_entries(diff(
            decoded.record_stream(),
            outcome.fingerprint.record_stream(),
        ))
        .unwrap();
        assert!(!summary.has_changes());
        assert_eq!(summary.unchanged, 0);
    }

    #[test]
    fn test_special_filenames() {
        let temp_dir = TempDir::new().unwrap();
        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "日本語.txt",
            "émoji-🎉.bin",
            ".hidden",
        ];
        for name in names {
            fs::write(temp_dir.path().join(name), name.as_bytes()).unwrap();
        }

        let outcome = build(temp_dir.path());
        assert_eq!(outcome.fingerprint.len(), names.len());
        for name in names {
            let path = RecordPath::parse(name).unwrap();
            let record = outcome.fingerprint.get(&path).unwrap();
            assert_eq!(record.digest(), Some(&DigestAlgorithm::Sha256.digest(name.as_bytes())));
        }
    }

    #[test]
    fn test_decomposed_names_are_normalized() {
        let temp_dir = TempDir::new().unwrap();
        // "e" followed by a combining acute accent
        fs::write(temp_dir.path().join("cafe\u{301}.txt"), b"coffee").unwrap();

        let outcome = build(temp_dir.path());
        assert_eq!(outcome.fingerprint.records[0].path.as_str(), "caf\u{e9}.txt");
    }

    #[test]
    fn test_nested_paths_use_forward_slashes() {
        let temp_dir = TempDir::new().unwrap();
        let deep = temp_dir.path().join("a").join("b").join("c");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf"), b"leaf").unwrap();

        let outcome = build(temp_dir.path());
        assert_eq!(outcome.fingerprint.records[0].path.as_str(), "a/b/c/leaf");
    }

    #[test]
    fn test_zero_length_and_block_boundary_files() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let block = 4096;
        fs::write(root.join("empty"), b"").unwrap();
        fs::write(root.join("exact"), vec![7u8; block]).unwrap();
        fs::write(root.join("over"), vec![7u8; block + 1]).unwrap();

        let outcome = FingerprintBuilder::new(root, BuildConfig::default().with_block_size(block))
            .unwrap()
            .build()
            .unwrap();
        let fp = &outcome.fingerprint;
        let get = |p: &str| fp.get(&RecordPath::parse(p).unwrap()).unwrap().clone();

        assert_eq!(get("empty").digest(), Some(&DigestAlgorithm::Sha256.digest(b"")));
        assert_eq!(get("exact").digest(), Some(&DigestAlgorithm::Sha256.digest(&vec![7u8; block])));
        assert_eq!(get("over").size, block as u64 + 1);
        assert_eq!(outcome.stats.bytes_hashed, 2 * block as u64 + 1);
    }

    #[test]
    fn test_block_size_does_not_change_digests() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("data"), vec![42u8; 100_000]).unwrap();

        let small = FingerprintBuilder::new(temp_dir.path(), BuildConfig::default().with_block_size(4096))
            .unwrap()
            .build()
            .unwrap();
        let large = build(temp_dir.path());
        assert_eq!(small.fingerprint.records, large.fingerprint.records);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_recorded_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/file"), b"payload").unwrap();
        std::os::unix::fs::symlink("real", root.join("link")).unwrap();

        let outcome = build(root);
        let paths: Vec<_> = outcome.fingerprint.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["link", "real/file"]);

        let link = &outcome.fingerprint.records[0];
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.digest(), Some(&DigestAlgorithm::Sha256.digest(b"real")));
    }

    #[test]
    fn test_excluded_paths_are_not_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("target")).unwrap();
        fs::write(root.join("target/out.o"), b"obj").unwrap();
        fs::write(root.join("keep.rs"), b"fn main() {}").unwrap();
        fs::write(root.join("scratch.tmp"), b"tmp").unwrap();

        let config = BuildConfig::default().with_exclude(vec!["target".into(), "*.tmp".into()]);
        let outcome = FingerprintBuilder::new(root, config).unwrap().build().unwrap();
        let paths: Vec<_> = outcome.fingerprint.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["keep.rs"]);
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let cases = vec![
            BuildConfig::default().with_block_size(1000),
            BuildConfig::default().with_block_size(1024),
            BuildConfig::default().with_workers(0),
            BuildConfig::default().with_exclude(vec!["[unclosed".into()]),
        ];
        for config in cases {
            let result = FingerprintBuilder::new(temp_dir.path(), config);
            assert!(matches!(result, Err(TreesumError::Config(_))));
        }
    }

    #[test]
    fn test_missing_root_fails_before_scanning() {
        let out_dir = TempDir::new().unwrap();
        let missing = out_dir.path().join("definitely-not-here");
        let dest = out_dir.path().join("fp.tsum");

        let err = FingerprintBuilder::new(&missing, BuildConfig::default())
            .and_then(|builder| builder.build_to_file(&dest, None))
            .unwrap_err();
        assert!(matches!(err, TreesumError::Config(_)), "{:?}", err);
        assert!(!dest.exists());
    }

    #[test]
    fn test_verify_against_missing_root_fails() {
        let tree = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        fs::write(tree.path().join("a"), b"a").unwrap();
        let fp = out_dir.path().join("fp.tsum");
        FingerprintBuilder::new(tree.path(), BuildConfig::default())
            .unwrap()
            .build_to_file(&fp, None)
            .unwrap();

        let result = verify_tree(&out_dir.path().join("gone"), &fp, BuildConfig::default());
        assert!(matches!(result, Err(TreesumError::Config(_))));
    }

    #[test]
    fn test_pre_cancelled_scan_leaves_no_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a"), b"a").unwrap();
        let dest = out_dir.path().join("never.tsum");

        let token = CancellationToken::new();
        token.cancel();
        let builder = FingerprintBuilder::new(temp_dir.path(), BuildConfig::default())
            .unwrap()
            .with_cancellation(token);

        assert!(matches!(builder.build_to_file(&dest, None), Err(TreesumError::Cancelled)));
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(out_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_artifact_that_is_not_a_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, b"just some text, definitely not a fingerprint").unwrap();

        let err = FingerprintFile::open_verified(&path).unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, TreesumError::Format(_)));

        fs::write(&path, b"").unwrap();
        assert!(FingerprintFile::open_verified(&path).unwrap_err().is_corruption());
    }
}
