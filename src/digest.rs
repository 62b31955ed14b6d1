//! Content hashing
//!
//! Streams one file's bytes through a digest function in fixed-size blocks
//! and produces a deterministic content digest. Memory use is bounded by a
//! single block buffer regardless of file size.
//!
//! ## Overview
//!
//! - [`DigestAlgorithm`] names the digest function and carries the stable
//!   8-byte identifier written into fingerprint artifacts.
//! - [`ContentDigest`] is the fixed-length output (32 bytes for every
//!   supported algorithm).
//! - [`ContentHasher`] hashes readers and files, optionally emitting one
//!   digest per block next to the file-level digest.
//!
//! The file-level digest depends on the byte content only. Paths, timestamps
//! and the block size never influence it.
//!
//! ## Example
//!
//! ```rust
//! use treesum::digest::{ContentHasher, DigestAlgorithm};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hasher = ContentHasher::new(DigestAlgorithm::Sha256, 4096)?;
//! let data = b"hello world";
//! let result = hasher.hash_reader(&data[..], data.len() as u64, None)?;
//! assert_eq!(result.digest, DigestAlgorithm::Sha256.digest(data));
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TreesumError};
use crate::types::CancellationToken;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Length in bytes of every content digest
pub const DIGEST_LEN: usize = 32;

/// Default hashing block size (1 MiB)
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Smallest accepted block size (4 KiB)
pub const MIN_BLOCK_SIZE: usize = 4 << 10;

/// Largest accepted block size (1 GiB)
pub const MAX_BLOCK_SIZE: usize = 1 << 30;

/// Digest function used for file contents and artifact trailers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256
    #[default]
    Sha256,
    /// BLAKE3 in its default 32-byte mode
    Blake3,
}

impl DigestAlgorithm {
    /// Stable identifier written into artifact headers
    pub fn id(&self) -> [u8; 8] {
        match self {
            DigestAlgorithm::Sha256 => *b"Sha2_256",
            DigestAlgorithm::Blake3 => *b"Blake3__",
        }
    }

    /// Resolve an artifact identifier, accepting historical spellings
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] for an identifier no known algorithm uses
    pub fn from_id(id: &[u8; 8]) -> Result<Self> {
        match id {
            b"Sha2_256" | b"Sha256__" | b"Sha2-256" | b"SHA256__" => Ok(DigestAlgorithm::Sha256),
            b"Blake3__" | b"BLAKE3__" => Ok(DigestAlgorithm::Blake3),
            other => Err(TreesumError::format(format!(
                "unknown digest algorithm identifier {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Human readable name, also accepted by [`FromStr`]
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Blake3 => "blake3",
        }
    }

    /// Start a streaming hasher for this algorithm
    pub fn hasher(&self) -> StreamHasher {
        match self {
            DigestAlgorithm::Sha256 => StreamHasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Blake3 => StreamHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// Digest an in-memory byte slice
    pub fn digest(&self, data: &[u8]) -> ContentDigest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = TreesumError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" | "sha2-256" | "sha2_256" => Ok(DigestAlgorithm::Sha256),
            "blake3" => Ok(DigestAlgorithm::Blake3),
            _ => Err(TreesumError::config(format!("unknown digest algorithm '{}'", s))),
        }
    }
}

/// Fixed-length content digest
///
/// Serializes as raw bytes in binary formats and as lowercase hex in
/// human-readable ones such as JSON.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest([u8; DIGEST_LEN]);

impl Serialize for ContentDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            ContentDigest::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; DIGEST_LEN]>::deserialize(deserializer).map(ContentDigest)
        }
    }
}

impl ContentDigest {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| TreesumError::format(format!("bad digest hex: {}", e)))?;
        let bytes: [u8; DIGEST_LEN] = bytes
            .try_into()
            .map_err(|_| TreesumError::format("digest must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self.to_hex())
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher over one of the supported algorithms
#[derive(Clone)]
pub enum StreamHasher {
    /// SHA-256 state
    Sha256(sha2::Sha256),
    /// BLAKE3 state (boxed, the state is large)
    Blake3(Box<blake3::Hasher>),
}

impl StreamHasher {
    /// Feed bytes into the hasher
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Sha256(h) => h.update(data),
            StreamHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Consume the hasher and produce the digest
    pub fn finalize(self) -> ContentDigest {
        match self {
            StreamHasher::Sha256(h) => ContentDigest(h.finalize().into()),
            StreamHasher::Blake3(h) => ContentDigest(*h.finalize().as_bytes()),
        }
    }
}

impl io::Write for StreamHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of hashing one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Digest over the whole content
    pub digest: ContentDigest,
    /// Number of bytes hashed
    pub bytes: u64,
    /// One digest per block, when block digests were requested
    pub blocks: Option<Vec<ContentDigest>>,
}

/// Why a stream could not be hashed to completion
enum HashFailure {
    Io(io::Error),
    SizeChanged { expected: u64, actual: u64 },
    Cancelled,
}

impl HashFailure {
    fn into_error(self, path: &Path) -> TreesumError {
        match self {
            HashFailure::Io(e) => TreesumError::read(path, e.to_string()),
            HashFailure::SizeChanged { expected, actual } => TreesumError::read(
                path,
                format!(
                    "size changed during read (expected {} bytes, read {})",
                    expected, actual
                ),
            ),
            HashFailure::Cancelled => TreesumError::Cancelled,
        }
    }
}

/// Block-wise content hasher
///
/// A `ContentHasher` is cheap to clone and holds no per-file state, so one
/// instance is shared by every hashing worker.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    algorithm: DigestAlgorithm,
    block_size: usize,
    block_digests: bool,
}

impl ContentHasher {
    /// Create a hasher for `algorithm` reading `block_size` bytes at a time
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Config`] if `block_size` is not a power of two
    ///   between 4 KiB and 1 GiB
    pub fn new(algorithm: DigestAlgorithm, block_size: usize) -> Result<Self> {
        validate_block_size(block_size)?;
        Ok(Self {
            algorithm,
            block_size,
            block_digests: false,
        })
    }

    /// Also produce a digest for every block
    pub fn with_block_digests(mut self, enabled: bool) -> Self {
        self.block_digests = enabled;
        self
    }

    /// Algorithm used by this hasher
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Configured block size in bytes
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Allocate a block buffer suitable for [`ContentHasher::hash_reader_with`]
    pub fn block_buffer(&self) -> Vec<u8> {
        vec![0u8; self.block_size]
    }

    /// Hash a byte stream that is expected to hold exactly `expected_size` bytes
    ///
    /// # Arguments
    ///
    /// * `reader` - Source of the content
    /// * `expected_size` - Size reported by the walker
    /// * `cancel` - Checked between blocks
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Read`] if the stream fails or yields a different
    ///   number of bytes than expected. No digest is produced in that case.
    /// - [`TreesumError::Cancelled`] if `cancel` fires mid-stream
    pub fn hash_reader<R: Read>(
        &self,
        reader: R,
        expected_size: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<FileDigest> {
        let mut buf = self.block_buffer();
        self.hash_stream(reader, expected_size, cancel, &mut buf)
            .map_err(|f| f.into_error(Path::new("<stream>")))
    }

    /// Like [`ContentHasher::hash_reader`] but reuses a caller-owned buffer
    pub fn hash_reader_with<R: Read>(
        &self,
        reader: R,
        expected_size: u64,
        cancel: Option<&CancellationToken>,
        buf: &mut Vec<u8>,
    ) -> Result<FileDigest> {
        self.hash_stream(reader, expected_size, cancel, buf)
            .map_err(|f| f.into_error(Path::new("<stream>")))
    }

    /// Open and hash the file at `path`
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Read`] carrying `path` if the file cannot be opened
    ///   or read to completion
    /// - [`TreesumError::Cancelled`] if `cancel` fires mid-file
    pub fn hash_file(
        &self,
        path: &Path,
        expected_size: u64,
        cancel: Option<&CancellationToken>,
        buf: &mut Vec<u8>,
    ) -> Result<FileDigest> {
        let file = File::open(path).map_err(|e| TreesumError::read(path, e.to_string()))?;
        self.hash_stream(file, expected_size, cancel, buf)
            .map_err(|f| f.into_error(path))
    }

    /// Digest an in-memory value such as a symlink target
    pub fn hash_bytes(&self, data: &[u8]) -> ContentDigest {
        self.algorithm.digest(data)
    }

    fn hash_stream<R: Read>(
        &self,
        mut reader: R,
        expected_size: u64,
        cancel: Option<&CancellationToken>,
        buf: &mut Vec<u8>,
    ) -> std::result::Result<FileDigest, HashFailure> {
        buf.resize(self.block_size, 0);
        let mut hasher = self.algorithm.hasher();
        let mut blocks = self.block_digests.then(Vec::new);
        let mut total: u64 = 0;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(HashFailure::Cancelled);
            }

            let filled = fill_block(&mut reader, buf).map_err(HashFailure::Io)?;
            if filled == 0 {
                break;
            }

            total += filled as u64;
            if total > expected_size {
                return Err(HashFailure::SizeChanged {
                    expected: expected_size,
                    actual: total,
                });
            }

            let block = &buf[..filled];
            hasher.update(block);
            if let Some(blocks) = blocks.as_mut() {
                blocks.push(self.algorithm.digest(block));
            }

            if filled < buf.len() {
                break;
            }
        }

        if total != expected_size {
            return Err(HashFailure::SizeChanged {
                expected: expected_size,
                actual: total,
            });
        }

        Ok(FileDigest {
            digest: hasher.finalize(),
            bytes: total,
            blocks,
        })
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::default(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_digests: false,
        }
    }
}

/// Check that `block_size` is a power of two within the accepted range
pub fn validate_block_size(block_size: usize) -> Result<()> {
    if !block_size.is_power_of_two() {
        return Err(TreesumError::config(format!(
            "block size {} is not a power of two",
            block_size
        )));
    }
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(TreesumError::config(format!(
            "block size {} outside {}..={}",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Read until `buf` is full or the stream ends, retrying interrupted reads
fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
