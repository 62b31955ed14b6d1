//! Tree verification against a stored fingerprint
//!
//! Verification answers "does this directory still hold what the
//! fingerprint says?" on filesystems that keep no checksums of their own.
//!
//! ## Process
//!
//! 1. The stored artifact is verified in full (structure and trailer).
//! 2. The live tree is rebuilt with the artifact's digest algorithm and
//!    [`TrustPolicy::AlwaysRehash`], so every file is read again.
//! 3. The stored and live record streams are diffed and each difference is
//!    sorted into missing, extra, mismatched or unreadable.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use treesum::config::BuildConfig;
//! use treesum::verification::TreeVerifier;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let verifier = TreeVerifier::new("./data", BuildConfig::default());
//! let report = verifier.verify(Path::new("./data.tsum"))?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::builder::FingerprintBuilder;
use crate::codec::FingerprintFile;
use crate::config::{BuildConfig, TrustPolicy};
use crate::diff::{diff, ChangeKind, DiffEntry};
use crate::error::Result;
use crate::types::ScanWarning;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Re-hashes a live tree and compares it with a stored fingerprint
#[derive(Debug, Clone)]
pub struct TreeVerifier {
    root: PathBuf,
    config: BuildConfig,
}

impl TreeVerifier {
    /// Create a verifier for `root`
    ///
    /// The algorithm and trust policy of `config` are overridden per run;
    /// walk options, workers and block size are used as given.
    pub fn new(root: impl Into<PathBuf>, config: BuildConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// Verify the tree against the fingerprint at `fingerprint_path`
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`](crate::TreesumError::Format) or
    ///   [`TreesumError::Integrity`](crate::TreesumError::Integrity) if the
    ///   stored artifact is corrupt
    /// - [`TreesumError::Config`](crate::TreesumError::Config) for an
    ///   invalid configuration
    pub fn verify(&self, fingerprint_path: &Path) -> Result<VerificationReport> {
        let start = Instant::now();
        let stored = FingerprintFile::open_verified(fingerprint_path)?;

        let mut config = self
            .config
            .clone()
            .with_algorithm(stored.header().algorithm)
            .with_trust(TrustPolicy::AlwaysRehash);
        if let Ok(relative) = fingerprint_path.strip_prefix(&self.root) {
            config.exclude.push(globset::escape(&relative.to_string_lossy()));
        }

        let live = FingerprintBuilder::new(&self.root, config)?.build()?;

        let mut report = VerificationReport::new(fingerprint_path);
        report.tree_digest = stored.summary().tree_digest.to_hex();
        report.warnings = live.warnings;

        for entry in diff(stored.records()?, live.fingerprint.record_stream()) {
            match entry? {
                DiffEntry::Unchanged { .. } => {
                    report.files_checked += 1;
                    report.files_valid += 1;
                }
                DiffEntry::Removed { record } => report.missing.push(record.path.to_string()),
                DiffEntry::Added { record } => report.extra.push(record.path.to_string()),
                DiffEntry::Modified { new, change, .. } => {
                    report.files_checked += 1;
                    if change == ChangeKind::Unknown {
                        report.unreadable.push(new.path.to_string());
                    } else {
                        report.mismatched.push(new.path.to_string());
                    }
                }
                DiffEntry::Moved { to, .. } => report.extra.push(to.path.to_string()),
            }
        }

        report.verification_time_ms = start.elapsed().as_millis() as u64;
        if report.is_clean() {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        Ok(report)
    }
}

/// Verify `root` against the fingerprint at `fingerprint_path`
pub fn verify_tree(root: &Path, fingerprint_path: &Path, config: BuildConfig) -> Result<VerificationReport> {
    TreeVerifier::new(root, config).verify(fingerprint_path)
}

/// Outcome of a tree verification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Fingerprint the tree was checked against
    pub fingerprint: PathBuf,
    /// Tree digest of the stored fingerprint
    pub tree_digest: String,
    /// Paths present on both sides
    pub files_checked: usize,
    /// Paths whose content still matches
    pub files_valid: usize,
    /// Recorded paths no longer in the tree
    pub missing: Vec<String>,
    /// Paths in the tree the fingerprint does not know
    pub extra: Vec<String>,
    /// Paths whose content or kind changed
    pub mismatched: Vec<String>,
    /// Paths that could not be compared because one side was unreadable
    pub unreadable: Vec<String>,
    /// Warnings from re-scanning the tree
    pub warnings: Vec<ScanWarning>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    /// Create an empty report
    pub fn new(fingerprint: &Path) -> Self {
        Self {
            fingerprint: fingerprint.to_path_buf(),
            ..Self::default()
        }
    }

    /// Whether the tree matches the fingerprint exactly
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.extra.is_empty()
            && self.mismatched.is_empty()
            && self.unreadable.is_empty()
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.is_clean() {
            format!(
                "Tree matches {:?} ({} files verified in {}ms)",
                self.fingerprint, self.files_valid, self.verification_time_ms
            )
        } else {
            let issues = [
                (!self.missing.is_empty()).then(|| format!("{} missing", self.missing.len())),
                (!self.extra.is_empty()).then(|| format!("{} extra", self.extra.len())),
                (!self.mismatched.is_empty())
                    .then(|| format!("{} mismatched", self.mismatched.len())),
                (!self.unreadable.is_empty())
                    .then(|| format!("{} unreadable", self.unreadable.len())),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");

            format!(
                "Tree differs from {:?}: {} ({}/{} files valid)",
                self.fingerprint, issues, self.files_valid, self.files_checked
            )
        }
    }
}
