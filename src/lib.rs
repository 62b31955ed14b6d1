//! # treesum - comparable fingerprints of large file trees
//!
//! treesum hashes the contents of a directory tree into a compact,
//! deterministic fingerprint, and compares two fingerprints to report which
//! files were added, removed or changed. The trees themselves never need to
//! be present at the same time.
//!
//! ## Overview
//!
//! - **Content hashing** ([`digest`]): block-wise SHA-256 or BLAKE3 over
//!   each file, memory bounded by one block
//! - **Fingerprint building** ([`builder`]): walk, canonical ordering,
//!   optional reuse of digests from a previous fingerprint, and a bounded
//!   pool of hashing threads
//! - **Artifacts** ([`codec`]): a self-describing binary format written and
//!   read record by record, with an integrity trailer
//! - **Diffing** ([`diff`]): a linear merge-join over two sorted record
//!   streams in constant memory
//! - **Renames** ([`rename`]): optional pairing of removed and added files
//!   with identical content
//! - **Verification** ([`verification`]): re-hash a live tree and compare it
//!   with a stored fingerprint
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use treesum::{diff, BuildConfig, FingerprintBuilder, FingerprintFile};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let builder = FingerprintBuilder::new("./data", BuildConfig::default())?;
//! builder.build_to_file(Path::new("monday.tsum"), None)?;
//!
//! // ... files change ...
//!
//! builder.build_to_file(Path::new("tuesday.tsum"), Some(Path::new("monday.tsum")))?;
//!
//! let old = FingerprintFile::open_verified(Path::new("monday.tsum"))?;
//! let new = FingerprintFile::open_verified(Path::new("tuesday.tsum"))?;
//! for entry in diff(old.records()?, new.records()?) {
//!     let entry = entry?;
//!     if entry.is_change() {
//!         println!("{}", entry);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Determinism
//!
//! Records are kept in canonical path order (component-wise, bytewise) with
//! `/` separators and NFC-normalized names. Two scans of identical trees
//! produce identical record sections and therefore the same tree digest,
//! whatever the walk order, the worker count or the time of the scan.
//!
//! ## Error Handling
//!
//! All operations return `Result<T, TreesumError>`. Unreadable files and
//! failed directory entries do not fail a build; they are reported as
//! [`ScanWarning`]s next to the fingerprint. Corrupt artifacts, invalid
//! configuration and cancellation abort the operation.
//!
//! ## Module Organization
//!
//! - [`builder`]: fingerprint construction
//! - [`codec`]: artifact format
//! - [`config`]: build configuration
//! - [`diff`]: merge-join comparison
//! - [`digest`]: content hashing
//! - [`rename`]: move detection
//! - [`types`]: records, fingerprints and scan bookkeeping
//! - [`verification`]: live tree verification
//! - [`walker`]: filesystem enumeration
//! - [`error`]: error types

pub mod builder;
pub mod codec;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod rename;
pub mod types;
pub mod verification;
pub mod walker;

// Internal helpers, partly re-exported below
pub mod utils;

// Re-export main types for convenience
pub use builder::{BuildOutcome, FingerprintBuilder};
pub use codec::{
    decode, encode, read_fingerprint, verify_artifact, write_fingerprint, ArtifactSummary,
    FingerprintFile, FingerprintReader, FingerprintWriter,
};
pub use config::{BuildConfig, SpecialPolicy, SymlinkPolicy, TrustPolicy};
pub use diff::{check_comparable, diff, ChangeKind, DiffEntry, DiffStream, DiffSummary};
pub use digest::{ContentDigest, ContentHasher, DigestAlgorithm};
pub use error::{Result, TreesumError};
pub use rename::{classify_renames, RenameClassifier, RenameConfig};
pub use types::*;
pub use verification::{verify_tree, TreeVerifier, VerificationReport};
pub use walker::FsWalker;
