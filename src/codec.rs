//! Fingerprint artifact encoding
//!
//! A fingerprint artifact is written and read one record at a time; neither
//! direction materializes the record sequence.
//!
//! ## Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! MAGIC            4 bytes   "TSUM"
//! FORMAT_VERSION   u16
//! ALGORITHM_ID     8 bytes   see DigestAlgorithm::id
//! HEADER_LEN       u32
//! HEADER           bincode: root, created_at, block_size, compression, trailer
//! BODY             optionally one LZ4 frame containing:
//!   RECORD*        tag 0x01, bincode(Record)
//!   END            tag 0x00, u64 record count
//!   TRAILER        if enabled: tree digest (32 bytes), artifact digest (32 bytes)
//! ```
//!
//! The **tree digest** covers the encoded records only, so two fingerprints
//! of identical trees share it even though their creation times differ. The
//! **artifact digest** covers every logical byte before the trailer.
//!
//! ## Failure model
//!
//! Structural problems (bad magic, unknown version or algorithm, malformed
//! or out-of-order records) are [`TreesumError::Format`]. A digest or count
//! mismatch, or an artifact that ends before its end marker or inside its
//! trailer, is [`TreesumError::Integrity`].
//!
//! [`FingerprintReader`] yields records as it goes and only knows the
//! artifact is sound when the stream ends. Callers that must not act on a
//! corrupt artifact use [`read_fingerprint`] (returns nothing unless the
//! trailer verified) or [`FingerprintFile::open_verified`] (runs a full
//! verification pass, then hands out fresh streaming readers).

use crate::digest::{ContentDigest, DigestAlgorithm, StreamHasher, DIGEST_LEN};
use crate::error::{Result, TreesumError};
use crate::types::{Compression, Fingerprint, FingerprintHeader, Record, RecordPath};
use crate::utils::AtomicFile;
use chrono::{DateTime, Utc};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Leading bytes of every artifact
pub const MAGIC: [u8; 4] = *b"TSUM";

/// Artifact format version written by this library
pub const FORMAT_VERSION: u16 = 1;

const TAG_END: u8 = 0x00;
const TAG_RECORD: u8 = 0x01;

/// Upper bound for one encoded header or record
const MAX_ITEM_LEN: usize = 1 << 20;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_ITEM_LEN>()
}

/// Header fields not carried by the fixed preamble
#[derive(Serialize, Deserialize)]
struct WireHeader {
    root: String,
    created_at: DateTime<Utc>,
    block_size: u32,
    compression: Compression,
    trailer: bool,
}

/// Digests and counts of a complete artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactSummary {
    /// Number of records
    pub records: u64,
    /// Digest of the encoded records
    pub tree_digest: ContentDigest,
    /// Digest of the artifact up to the trailer
    pub artifact_digest: ContentDigest,
    /// Whether a trailer was present and matched
    pub trailer_verified: bool,
}

enum BodySink<W: Write> {
    Plain(W),
    Lz4(FrameEncoder<W>),
}

impl<W: Write> Write for BodySink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            BodySink::Plain(w) => w.write(buf),
            BodySink::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BodySink::Plain(w) => w.flush(),
            BodySink::Lz4(w) => w.flush(),
        }
    }
}

/// Streaming artifact writer
///
/// Records must arrive in strictly ascending canonical order. Nothing marks
/// the artifact complete until [`FingerprintWriter::finish`] has written the
/// end marker and trailer; pair the writer with an
/// [`AtomicFile`](crate::utils::AtomicFile) so an abandoned write leaves no
/// file behind.
pub struct FingerprintWriter<W: Write> {
    sink: BodySink<W>,
    trailer: bool,
    artifact: StreamHasher,
    tree: StreamHasher,
    last: Option<RecordPath>,
    count: u64,
    scratch: Vec<u8>,
}

impl<W: Write> FingerprintWriter<W> {
    /// Write the preamble and header
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] if the header asks for another format version
    /// - [`TreesumError::Io`] if writing fails
    pub fn new(mut writer: W, header: &FingerprintHeader) -> Result<Self> {
        if header.format_version != FORMAT_VERSION {
            return Err(TreesumError::format(format!(
                "cannot write format version {}",
                header.format_version
            )));
        }

        let wire = WireHeader {
            root: header.root.clone(),
            created_at: header.created_at,
            block_size: header.block_size,
            compression: header.compression,
            trailer: header.trailer,
        };
        let header_bytes = bincode::serde::encode_to_vec(&wire, wire_config())?;

        let mut preamble = Vec::with_capacity(18 + header_bytes.len());
        preamble.extend_from_slice(&MAGIC);
        preamble.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        preamble.extend_from_slice(&header.algorithm.id());
        preamble.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        preamble.extend_from_slice(&header_bytes);
        writer.write_all(&preamble)?;

        let mut artifact = header.algorithm.hasher();
        artifact.update(&preamble);

        let sink = match header.compression {
            Compression::None => BodySink::Plain(writer),
            Compression::Lz4 => BodySink::Lz4(FrameEncoder::new(writer)),
        };

        Ok(Self {
            sink,
            trailer: header.trailer,
            artifact,
            tree: header.algorithm.hasher(),
            last: None,
            count: 0,
            scratch: Vec::new(),
        })
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] if the path is not canonical or not
    ///   strictly greater than the previous record's path
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        record.path.validate()?;
        if let Some(last) = &self.last {
            if record.path <= *last {
                return Err(TreesumError::format(format!(
                    "record '{}' written after '{}'",
                    record.path, last
                )));
            }
        }

        self.scratch.clear();
        bincode::serde::encode_into_std_write(record, &mut self.scratch, wire_config())?;

        self.sink.write_all(&[TAG_RECORD])?;
        self.sink.write_all(&self.scratch)?;
        self.artifact.update(&[TAG_RECORD]);
        self.artifact.update(&self.scratch);
        self.tree.update(&self.scratch);

        self.count += 1;
        self.last = Some(record.path.clone());
        Ok(())
    }

    /// Number of records written so far
    pub fn records_written(&self) -> u64 {
        self.count
    }

    /// Write the end marker and trailer, returning the inner writer
    pub fn finish(mut self) -> Result<(W, ArtifactSummary)> {
        let mut end = [0u8; 9];
        end[0] = TAG_END;
        end[1..].copy_from_slice(&self.count.to_le_bytes());
        self.sink.write_all(&end)?;
        self.artifact.update(&end);

        let tree_digest = self.tree.finalize();
        let artifact_digest = self.artifact.finalize();
        if self.trailer {
            self.sink.write_all(tree_digest.as_bytes())?;
            self.sink.write_all(artifact_digest.as_bytes())?;
        }

        let mut writer = match self.sink {
            BodySink::Plain(w) => w,
            BodySink::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| TreesumError::Io(io::Error::other(e)))?,
        };
        writer.flush()?;

        trace!("Finished artifact with {} records", self.count);
        Ok((
            writer,
            ArtifactSummary {
                records: self.count,
                tree_digest,
                artifact_digest,
                trailer_verified: false,
            },
        ))
    }
}

enum BodySource<R: Read> {
    Plain(R),
    Lz4(FrameDecoder<R>),
}

impl<R: Read> Read for BodySource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodySource::Plain(r) => r.read(buf),
            BodySource::Lz4(r) => r.read(buf).map_err(|e| match e.kind() {
                io::ErrorKind::Other => io::Error::new(io::ErrorKind::InvalidData, e),
                _ => e,
            }),
        }
    }
}

/// Reader that feeds everything it returns into the running digests
struct HashingReader<R: Read> {
    inner: R,
    artifact: StreamHasher,
    tree: StreamHasher,
    in_record: bool,
    hashing: bool,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if self.hashing {
            self.artifact.update(&buf[..n]);
            if self.in_record {
                self.tree.update(&buf[..n]);
            }
        }
        Ok(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Records,
    Done,
    Failed,
}

/// Map an I/O failure while reading an artifact onto the error taxonomy
fn read_failure(e: io::Error, what: &str) -> TreesumError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof => {
            TreesumError::integrity(format!("artifact truncated in {}", what))
        }
        io::ErrorKind::InvalidData => TreesumError::format(format!("corrupt {}: {}", what, e)),
        _ => TreesumError::Io(e),
    }
}

fn decode_failure(e: bincode::error::DecodeError, what: &str) -> TreesumError {
    match e {
        bincode::error::DecodeError::Io { inner, .. } => read_failure(inner, what),
        bincode::error::DecodeError::UnexpectedEnd { .. } => {
            TreesumError::integrity(format!("artifact truncated in {}", what))
        }
        other => TreesumError::format(format!("malformed {}: {}", what, other)),
    }
}

/// Streaming artifact reader
///
/// Iterating yields records in canonical order. The final item is an error
/// if the artifact turns out to be truncated, reordered or corrupt, and the
/// iterator is fused after its first error.
pub struct FingerprintReader<R: Read> {
    header: FingerprintHeader,
    body: HashingReader<BodySource<BufReader<R>>>,
    last: Option<RecordPath>,
    count: u64,
    state: ReadState,
    summary: Option<ArtifactSummary>,
}

impl<R: Read> FingerprintReader<R> {
    /// Read and validate the preamble and header
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] for a missing magic, unsupported version,
    ///   unknown algorithm or malformed header
    /// - [`TreesumError::Integrity`] if the artifact ends inside the header
    pub fn new(reader: R) -> Result<Self> {
        let mut reader = BufReader::new(reader);

        let mut fixed = [0u8; 18];
        reader.read_exact(&mut fixed).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => TreesumError::format("missing fingerprint header"),
            _ => TreesumError::Io(e),
        })?;
        if fixed[0..4] != MAGIC {
            return Err(TreesumError::format("not a fingerprint artifact (bad magic)"));
        }
        let version = u16::from_le_bytes([fixed[4], fixed[5]]);
        if version != FORMAT_VERSION {
            return Err(TreesumError::format(format!(
                "unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&fixed[6..14]);
        let algorithm = DigestAlgorithm::from_id(&id)?;
        let header_len = u32::from_le_bytes([fixed[14], fixed[15], fixed[16], fixed[17]]) as usize;
        if header_len > MAX_ITEM_LEN {
            return Err(TreesumError::format(format!("header length {} too large", header_len)));
        }

        let mut header_bytes = vec![0u8; header_len];
        reader
            .read_exact(&mut header_bytes)
            .map_err(|e| read_failure(e, "header"))?;
        let (wire, used): (WireHeader, usize) =
            bincode::serde::decode_from_slice(&header_bytes, wire_config())
                .map_err(|e| TreesumError::format(format!("malformed header: {}", e)))?;
        if used != header_len {
            return Err(TreesumError::format("header length mismatch"));
        }

        let mut artifact = algorithm.hasher();
        artifact.update(&fixed);
        artifact.update(&header_bytes);

        let header = FingerprintHeader {
            format_version: version,
            algorithm,
            root: wire.root,
            created_at: wire.created_at,
            block_size: wire.block_size,
            compression: wire.compression,
            trailer: wire.trailer,
        };

        let source = match header.compression {
            Compression::None => BodySource::Plain(reader),
            Compression::Lz4 => BodySource::Lz4(FrameDecoder::new(reader)),
        };

        Ok(Self {
            body: HashingReader {
                inner: source,
                artifact,
                tree: algorithm.hasher(),
                in_record: false,
                hashing: true,
            },
            header,
            last: None,
            count: 0,
            state: ReadState::Records,
            summary: None,
        })
    }

    /// Header of the artifact
    pub fn header(&self) -> &FingerprintHeader {
        &self.header
    }

    /// Digests of the artifact, available once the stream ended cleanly
    pub fn summary(&self) -> Option<&ArtifactSummary> {
        self.summary.as_ref()
    }

    /// Drain the stream, keeping no records, and return the verified summary
    pub fn verify(mut self) -> Result<ArtifactSummary> {
        for record in self.by_ref() {
            record?;
        }
        self.summary
            .ok_or_else(|| TreesumError::internal("stream ended without a summary"))
    }

    fn read_next(&mut self) -> Result<Option<Record>> {
        let mut tag = [0u8; 1];
        self.body
            .read_exact(&mut tag)
            .map_err(|e| read_failure(e, "record stream (missing end marker)"))?;

        match tag[0] {
            TAG_RECORD => {
                self.body.in_record = true;
                let decoded = bincode::serde::decode_from_std_read::<Record, _, _>(
                    &mut self.body,
                    wire_config(),
                );
                self.body.in_record = false;
                let record = decoded.map_err(|e| decode_failure(e, "record"))?;

                record.path.validate()?;
                if let Some(last) = &self.last {
                    if record.path <= *last {
                        return Err(TreesumError::format(format!(
                            "record '{}' out of order after '{}'",
                            record.path, last
                        )));
                    }
                }
                self.last = Some(record.path.clone());
                self.count += 1;
                Ok(Some(record))
            }
            TAG_END => {
                self.finish_stream()?;
                Ok(None)
            }
            other => Err(TreesumError::format(format!("unknown record tag 0x{:02x}", other))),
        }
    }

    fn finish_stream(&mut self) -> Result<()> {
        let mut count = [0u8; 8];
        self.body
            .read_exact(&mut count)
            .map_err(|e| read_failure(e, "end marker"))?;
        let expected = u64::from_le_bytes(count);
        if expected != self.count {
            return Err(TreesumError::integrity(format!(
                "record count mismatch: end marker says {}, read {}",
                expected, self.count
            )));
        }

        self.body.hashing = false;
        let algorithm = self.header.algorithm;
        let artifact_digest =
            std::mem::replace(&mut self.body.artifact, algorithm.hasher()).finalize();
        let tree_digest = std::mem::replace(&mut self.body.tree, algorithm.hasher()).finalize();

        if self.header.trailer {
            let mut trailer = [0u8; DIGEST_LEN * 2];
            self.body
                .read_exact(&mut trailer)
                .map_err(|e| read_failure(e, "trailer"))?;
            let mut stored_tree = [0u8; DIGEST_LEN];
            let mut stored_artifact = [0u8; DIGEST_LEN];
            stored_tree.copy_from_slice(&trailer[..DIGEST_LEN]);
            stored_artifact.copy_from_slice(&trailer[DIGEST_LEN..]);

            if ContentDigest::from_bytes(stored_artifact) != artifact_digest {
                return Err(TreesumError::integrity("artifact digest does not match trailer"));
            }
            if ContentDigest::from_bytes(stored_tree) != tree_digest {
                return Err(TreesumError::integrity("tree digest does not match trailer"));
            }
        }

        let mut extra = [0u8; 1];
        let trailing = loop {
            match self.body.read(&mut extra) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_failure(e, "artifact end")),
            }
        };
        if trailing != 0 {
            return Err(TreesumError::format("unexpected data after end of artifact"));
        }

        self.summary = Some(ArtifactSummary {
            records: self.count,
            tree_digest,
            artifact_digest,
            trailer_verified: self.header.trailer,
        });
        Ok(())
    }
}

impl<R: Read> Iterator for FingerprintReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state != ReadState::Records {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.state = ReadState::Done;
                None
            }
            Err(e) => {
                self.state = ReadState::Failed;
                Some(Err(e))
            }
        }
    }
}

/// Stream a complete fingerprint into `writer`
pub fn write_fingerprint_to<W: Write>(writer: W, fingerprint: &Fingerprint) -> Result<(W, ArtifactSummary)> {
    let mut out = FingerprintWriter::new(writer, &fingerprint.header)?;
    for record in &fingerprint.records {
        out.write_record(record)?;
    }
    out.finish()
}

/// Encode a fingerprint into memory
pub fn encode(fingerprint: &Fingerprint) -> Result<Vec<u8>> {
    let (bytes, _) = write_fingerprint_to(Vec::new(), fingerprint)?;
    Ok(bytes)
}

/// Read a complete fingerprint, returning it only if the whole artifact is sound
pub fn read_fingerprint_from<R: Read>(reader: R) -> Result<Fingerprint> {
    let mut stream = FingerprintReader::new(reader)?;
    let mut records = Vec::new();
    for record in stream.by_ref() {
        records.push(record?);
    }
    Ok(Fingerprint {
        header: stream.header.clone(),
        records,
    })
}

/// Decode a fingerprint from memory
pub fn decode(bytes: &[u8]) -> Result<Fingerprint> {
    read_fingerprint_from(bytes)
}

/// Write a fingerprint file atomically
pub fn write_fingerprint(path: &Path, fingerprint: &Fingerprint) -> Result<ArtifactSummary> {
    let file = AtomicFile::create(path)?;
    let (file, summary) = write_fingerprint_to(file, fingerprint)?;
    file.commit()?;
    debug!("Wrote {} records to {:?}", summary.records, path);
    Ok(summary)
}

/// Read a fingerprint file into memory
pub fn read_fingerprint(path: &Path) -> Result<Fingerprint> {
    read_fingerprint_from(File::open(path)?)
}

/// Validate a fingerprint file without keeping its records
pub fn verify_artifact(path: &Path) -> Result<ArtifactSummary> {
    FingerprintReader::new(File::open(path)?)?.verify()
}

/// Tree digest of an in-memory fingerprint
pub fn tree_digest(fingerprint: &Fingerprint) -> Result<ContentDigest> {
    let (_, summary) = write_fingerprint_to(io::sink(), fingerprint)?;
    Ok(summary.tree_digest)
}

/// A fingerprint file that passed verification
///
/// [`FingerprintFile::records`] opens a fresh streaming reader each call,
/// which is how the diff engine consumes large fingerprints without loading
/// them.
#[derive(Debug, Clone)]
pub struct FingerprintFile {
    path: PathBuf,
    header: FingerprintHeader,
    summary: ArtifactSummary,
}

impl FingerprintFile {
    /// Verify the whole file before handing out readers
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Format`] or [`TreesumError::Integrity`] if the file
    ///   is corrupt; no reader is ever produced for it
    pub fn open_verified(path: &Path) -> Result<Self> {
        let reader = FingerprintReader::new(File::open(path)?)?;
        let header = reader.header().clone();
        let summary = reader.verify()?;
        debug!(
            "Verified {:?}: {} records, tree digest {}",
            path, summary.records, summary.tree_digest
        );
        Ok(Self {
            path: path.to_path_buf(),
            header,
            summary,
        })
    }

    /// Path of the artifact
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of the artifact
    pub fn header(&self) -> &FingerprintHeader {
        &self.header
    }

    /// Digests from the verification pass
    pub fn summary(&self) -> &ArtifactSummary {
        &self.summary
    }

    /// Open a new streaming reader over the records
    pub fn records(&self) -> Result<FingerprintReader<File>> {
        FingerprintReader::new(File::open(&self.path)?)
    }
}
