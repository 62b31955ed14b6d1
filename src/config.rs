//! Build configuration
//!
//! [`BuildConfig`] is passed explicitly into every build; nothing is read
//! from process-wide state. Every field has a documented default, and the
//! whole value can be loaded from a JSON file where missing fields fall back
//! to those defaults.
//!
//! ## Defaults
//!
//! | Option            | Default                  |
//! |-------------------|--------------------------|
//! | `algorithm`       | SHA-256                  |
//! | `block_size`      | 1 MiB                    |
//! | `trust`           | [`TrustPolicy::AlwaysRehash`] |
//! | `symlinks`        | [`SymlinkPolicy::Record`] |
//! | `special_files`   | [`SpecialPolicy::Record`] |
//! | `workers`         | number of CPUs           |
//! | `queue_depth`     | 4 x workers              |
//! | `compression`     | none                     |
//! | `trailer`         | on                       |
//!
//! ## Example
//!
//! ```rust
//! use treesum::config::{BuildConfig, TrustPolicy};
//! use treesum::digest::DigestAlgorithm;
//!
//! let config = BuildConfig::default()
//!     .with_algorithm(DigestAlgorithm::Blake3)
//!     .with_trust(TrustPolicy::TrustMetadata)
//!     .with_workers(4);
//! assert!(config.validate().is_ok());
//! ```

use crate::digest::{self, DigestAlgorithm, DEFAULT_BLOCK_SIZE};
use crate::error::{Result, TreesumError};
use crate::types::Compression;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Whether unchanged metadata is trusted to mean unchanged content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustPolicy {
    /// Copy the previous digest when path, size, mtime and kind all match.
    /// A file rewritten in place with the same size and mtime goes unnoticed.
    TrustMetadata,
    /// Hash every file regardless of any previous fingerprint
    #[default]
    AlwaysRehash,
}

/// How symbolic links are fingerprinted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymlinkPolicy {
    /// Record the link itself; its digest covers the target path text
    #[default]
    Record,
    /// Follow links and hash what they point to
    Follow,
    /// Leave links out of the fingerprint
    Skip,
}

/// How devices, sockets and pipes are fingerprinted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialPolicy {
    /// Record the entry with kind `Special` and no digest
    #[default]
    Record,
    /// Leave special files out of the fingerprint
    Skip,
}

/// Configuration for one fingerprint build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Digest function for contents and the artifact trailer
    pub algorithm: DigestAlgorithm,
    /// Hashing block size in bytes (power of two, 4 KiB to 1 GiB)
    pub block_size: usize,
    /// Reuse policy against a previous fingerprint
    pub trust: TrustPolicy,
    /// Symbolic link handling
    pub symlinks: SymlinkPolicy,
    /// Special file handling
    pub special_files: SpecialPolicy,
    /// Number of hashing threads
    pub workers: usize,
    /// Bound of the hashing queue; 0 means four jobs per worker
    pub queue_depth: usize,
    /// Artifact body compression
    pub compression: Compression,
    /// Write the integrity trailer
    pub trailer: bool,
    /// Glob patterns, relative to the scan root, excluded from the walk
    pub exclude: Vec<String>,
    /// Do not descend into other file systems
    pub same_file_system: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            trust: TrustPolicy::default(),
            symlinks: SymlinkPolicy::default(),
            special_files: SpecialPolicy::default(),
            workers: num_cpus::get(),
            queue_depth: 0,
            compression: Compression::None,
            trailer: true,
            exclude: Vec::new(),
            same_file_system: false,
        }
    }
}

impl BuildConfig {
    /// Load a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Io`] if the file cannot be read
    /// - [`TreesumError::Config`] if it is not valid JSON for this type or
    ///   fails [`BuildConfig::validate`]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: BuildConfig = serde_json::from_str(&text)
            .map_err(|e| TreesumError::config(format!("{:?}: {}", path, e)))?;
        config.validate()?;
        debug!("Loaded build configuration from {:?}", path);
        Ok(config)
    }

    /// Set the digest algorithm
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the hashing block size
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Set the reuse policy
    pub fn with_trust(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Set the symbolic link policy
    pub fn with_symlinks(mut self, symlinks: SymlinkPolicy) -> Self {
        self.symlinks = symlinks;
        self
    }

    /// Set the special file policy
    pub fn with_special_files(mut self, special: SpecialPolicy) -> Self {
        self.special_files = special;
        self
    }

    /// Set number of hashing workers (minimum 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the hashing queue bound
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set artifact body compression
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Enable or disable the integrity trailer
    pub fn with_trailer(mut self, trailer: bool) -> Self {
        self.trailer = trailer;
        self
    }

    /// Set exclusion glob patterns
    pub fn with_exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    /// Effective queue bound
    pub fn effective_queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            self.workers.max(1) * 4
        } else {
            self.queue_depth
        }
    }

    /// Reject invalid settings before any scan work starts
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Config`] for a bad block size, zero workers or an
    ///   unparsable exclusion pattern
    pub fn validate(&self) -> Result<()> {
        digest::validate_block_size(self.block_size)?;
        if self.block_size > u32::MAX as usize {
            return Err(TreesumError::config("block size does not fit the artifact header"));
        }
        if self.workers == 0 {
            return Err(TreesumError::config("workers must be at least 1"));
        }
        for pattern in &self.exclude {
            Glob::new(pattern).map_err(|e| {
                TreesumError::config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }
}
