//! Fingerprint construction
//!
//! The builder turns a walk into a canonically ordered [`Fingerprint`].
//!
//! ## Pipeline
//!
//! 1. **Collect**: walk entries are filtered through the symlink and special
//!    file policies and their paths canonicalized. Walk errors become
//!    [`ScanWarning`]s and the entry is skipped.
//! 2. **Order**: entries are sorted into canonical path order. When two
//!    entries map to the same canonical path the first one wins.
//! 3. **Reuse**: with [`TrustPolicy::TrustMetadata`], the sorted entries are
//!    merge-joined against the previous fingerprint's record stream. A
//!    record at the same path with equal size, modification time and kind
//!    donates its digest. The previous fingerprint is consumed as a stream
//!    and never held in memory.
//! 4. **Hash**: the remaining files go through a bounded job queue to a
//!    pool of hashing threads. Each result carries the slot index of its
//!    entry, so the final order never depends on which worker finished
//!    first.
//! 5. **Assemble**: slots are zipped with their entries into records.
//!
//! Unreadable files become [`RecordContent::Unreadable`] records and the
//! build carries on. Cancellation stops the queue, aborts in-flight hashes
//! at their next block boundary and fails the build with
//! [`TreesumError::Cancelled`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use treesum::builder::FingerprintBuilder;
//! use treesum::config::BuildConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let builder = FingerprintBuilder::new("./data", BuildConfig::default())?;
//! let outcome = builder.build()?;
//! println!("{} records, {} warnings", outcome.fingerprint.len(), outcome.warnings.len());
//! # Ok(())
//! # }
//! ```

use crate::codec::{ArtifactSummary, FingerprintFile, FingerprintWriter, FORMAT_VERSION};
use crate::config::{BuildConfig, SpecialPolicy, SymlinkPolicy, TrustPolicy};
use crate::digest::{ContentHasher, FileDigest};
use crate::error::{Result, TreesumError};
use crate::types::{
    BuildStats, CancellationToken, EntryKind, Fingerprint, FingerprintHeader, ProgressInfo,
    Record, RecordContent, RecordPath, ScanWarning, WalkEntry, WarningKind,
};
use crate::utils::{self, AtomicFile};
use crate::walker::FsWalker;
use chrono::Utc;
use crossbeam_channel::{bounded, unbounded};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Progress callback invoked from the collecting thread
pub type ProgressCallback = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Result of a successful build
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The new fingerprint
    pub fingerprint: Fingerprint,
    /// Per-entry problems that did not abort the build
    pub warnings: Vec<ScanWarning>,
    /// Counters
    pub stats: BuildStats,
}

/// One file waiting for the hashing pool
struct HashJob {
    index: usize,
    path: PathBuf,
    size: u64,
    kind: EntryKind,
}

/// Orchestrates walker, reuse cache and hashing pool
pub struct FingerprintBuilder {
    root: PathBuf,
    config: BuildConfig,
    hasher: ContentHasher,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl FingerprintBuilder {
    /// Create a builder for `root`
    ///
    /// # Errors
    ///
    /// - [`TreesumError::Config`] if `config` fails validation or `root`
    ///   is not an existing directory. No scan work happens before these
    ///   checks.
    pub fn new(root: impl Into<PathBuf>, config: BuildConfig) -> Result<Self> {
        let root = root.into();
        config.validate()?;
        match std::fs::metadata(&root) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(TreesumError::config(format!(
                    "scan root {:?} is not a directory",
                    root
                )))
            }
            Err(e) => {
                return Err(TreesumError::config(format!(
                    "scan root {:?} is not accessible: {}",
                    root, e
                )))
            }
        }
        let hasher = ContentHasher::new(config.algorithm, config.block_size)?;
        Ok(Self {
            root,
            config,
            hasher,
            cancel: CancellationToken::new(),
            progress: None,
        })
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Report hashing progress through `callback`
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Token that cancels this builder's runs
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Walk the root and build a fingerprint from scratch
    pub fn build(&self) -> Result<BuildOutcome> {
        let walker = self.walker(&[])?;
        self.build_from_entries(walker, None::<(&FingerprintHeader, std::iter::Empty<Result<Record>>)>)
    }

    /// Walk the root and build, reusing digests from a previous fingerprint
    ///
    /// `records` must be the previous fingerprint's records in canonical
    /// order. They are only read when the trust policy allows reuse and the
    /// previous fingerprint used the same digest algorithm.
    ///
    /// # Errors
    ///
    /// An error item in `records` aborts the build, since digests from a
    /// corrupt fingerprint cannot be trusted.
    pub fn build_with_previous<I>(&self, header: &FingerprintHeader, records: I) -> Result<BuildOutcome>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let walker = self.walker(&[])?;
        self.build_from_entries(walker, Some((header, records)))
    }

    /// Build, then write the artifact to `dest` atomically
    ///
    /// The artifact only appears at `dest` after its trailer was written.
    /// A failed or cancelled build leaves `dest` untouched. When `dest` lies
    /// inside the scanned tree it is excluded from the walk.
    ///
    /// # Arguments
    ///
    /// * `dest` - Output path
    /// * `previous` - Optional earlier fingerprint of the same root; it is
    ///   verified in full before any of its digests are reused
    pub fn build_to_file(&self, dest: &Path, previous: Option<&Path>) -> Result<(BuildOutcome, ArtifactSummary)> {
        let mut extra_excludes = Vec::new();
        if let Ok(relative) = dest.strip_prefix(&self.root) {
            extra_excludes.push(globset::escape(&relative.to_string_lossy()));
        }
        let walker = self.walker(&extra_excludes)?;

        let outcome = match previous {
            Some(path) => {
                let file = FingerprintFile::open_verified(path)?;
                let records = file.records()?;
                self.build_from_entries(walker, Some((file.header(), records)))?
            }
            None => self.build_from_entries(
                walker,
                None::<(&FingerprintHeader, std::iter::Empty<Result<Record>>)>,
            )?,
        };

        if self.cancel.is_cancelled() {
            return Err(TreesumError::Cancelled);
        }

        let out = AtomicFile::create(dest)?;
        let mut writer = FingerprintWriter::new(out, &outcome.fingerprint.header)?;
        for record in &outcome.fingerprint.records {
            writer.write_record(record)?;
        }
        let (out, summary) = writer.finish()?;
        if self.cancel.is_cancelled() {
            return Err(TreesumError::Cancelled);
        }
        out.commit()?;

        info!(
            "Wrote fingerprint {:?} ({} records, tree digest {})",
            dest, summary.records, summary.tree_digest
        );
        Ok((outcome, summary))
    }

    /// Build from an arbitrary entry stream
    ///
    /// This is the core of every build method. `entries` need not be
    /// sorted; entry errors become warnings.
    pub fn build_from_entries<E, I>(
        &self,
        entries: E,
        previous: Option<(&FingerprintHeader, I)>,
    ) -> Result<BuildOutcome>
    where
        E: IntoIterator<Item = Result<WalkEntry>>,
        I: IntoIterator<Item = Result<Record>>,
    {
        let start = Instant::now();
        let mut stats = BuildStats::default();
        let mut warnings = Vec::new();

        info!("Building fingerprint of {:?}", self.root);

        let pending = self.collect_entries(entries, &mut stats, &mut warnings)?;
        let mut contents: Vec<Option<RecordContent>> = vec![None; pending.len()];

        let previous = match previous {
            Some((header, records)) if self.config.trust == TrustPolicy::TrustMetadata => {
                if header.algorithm == self.config.algorithm {
                    Some(records)
                } else {
                    warn!(
                        "Previous fingerprint uses {}, not {}; rehashing everything",
                        header.algorithm, self.config.algorithm
                    );
                    None
                }
            }
            _ => None,
        };

        let jobs = self.plan(&pending, previous, &mut contents, &mut stats)?;
        self.hash_all(jobs, &mut contents, &mut stats, &mut warnings)?;

        let records = pending
            .into_iter()
            .zip(contents)
            .map(|((path, entry), content)| {
                let content = content.ok_or_else(|| {
                    TreesumError::internal(format!("no content computed for '{}'", path))
                })?;
                Ok(Record {
                    path,
                    size: entry.size,
                    modified: entry.modified,
                    kind: entry.kind,
                    content,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        stats.records = records.len();
        stats.duration = start.elapsed();

        let header = FingerprintHeader {
            format_version: FORMAT_VERSION,
            algorithm: self.config.algorithm,
            root: self.root.display().to_string(),
            created_at: Utc::now(),
            block_size: self.config.block_size as u32,
            compression: self.config.compression,
            trailer: self.config.trailer,
        };

        info!(
            "Fingerprint built: {} records ({} hashed, {} reused, {} unreadable, {} skipped) in {:?}",
            stats.records,
            stats.files_hashed,
            stats.files_reused,
            stats.files_unreadable,
            stats.entries_skipped,
            stats.duration
        );

        Ok(BuildOutcome {
            fingerprint: Fingerprint { header, records },
            warnings,
            stats,
        })
    }

    fn walker(&self, extra_excludes: &[String]) -> Result<FsWalker> {
        let mut exclude = self.config.exclude.clone();
        exclude.extend_from_slice(extra_excludes);
        FsWalker::new(
            &self.root,
            self.config.symlinks == SymlinkPolicy::Follow,
            self.config.same_file_system,
            &exclude,
        )
    }

    /// Apply kind policies, canonicalize, sort and deduplicate
    fn collect_entries<E>(
        &self,
        entries: E,
        stats: &mut BuildStats,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<Vec<(RecordPath, WalkEntry)>>
    where
        E: IntoIterator<Item = Result<WalkEntry>>,
    {
        let mut pending = Vec::new();

        for entry in entries {
            if self.cancel.is_cancelled() {
                return Err(TreesumError::Cancelled);
            }
            stats.entries_seen += 1;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.is_recoverable() => {
                    warn!("Skipping entry: {}", e);
                    warnings.push(ScanWarning::from_error(&e));
                    stats.entries_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let skip = match entry.kind {
                EntryKind::Symlink => self.config.symlinks == SymlinkPolicy::Skip,
                EntryKind::Special => self.config.special_files == SpecialPolicy::Skip,
                EntryKind::File => false,
            };
            if skip {
                debug!("Skipping {} {:?} by policy", entry.kind, entry.relative);
                stats.entries_skipped += 1;
                continue;
            }

            match RecordPath::from_relative(&entry.relative) {
                Ok(path) => pending.push((path, entry)),
                Err(e) => {
                    warn!("Skipping entry: {}", e);
                    warnings.push(ScanWarning::from_error(&e));
                    stats.entries_skipped += 1;
                }
            }
        }

        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut deduped: Vec<(RecordPath, WalkEntry)> = Vec::with_capacity(pending.len());
        for (path, entry) in pending {
            if let Some((last, kept)) = deduped.last() {
                if *last == path {
                    warn!("{:?} maps to '{}' already taken by {:?}", entry.path, path, kept.path);
                    warnings.push(ScanWarning {
                        path: entry.path.clone(),
                        kind: WarningKind::DuplicatePath,
                        message: format!("duplicate canonical path '{}'", path),
                    });
                    stats.entries_skipped += 1;
                    continue;
                }
            }
            deduped.push((path, entry));
        }

        debug!("Collected {} entries", deduped.len());
        Ok(deduped)
    }

    /// Decide per entry between reuse, no content, and hashing
    fn plan<I>(
        &self,
        pending: &[(RecordPath, WalkEntry)],
        previous: Option<I>,
        contents: &mut [Option<RecordContent>],
        stats: &mut BuildStats,
    ) -> Result<Vec<HashJob>>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let mut previous = previous.map(|p| p.into_iter());
        let mut prev_head: Option<Record> = None;
        let mut prev_last: Option<RecordPath> = None;
        let mut jobs = Vec::new();

        for (index, (path, entry)) in pending.iter().enumerate() {
            if entry.kind == EntryKind::Special {
                contents[index] = Some(RecordContent::Absent);
                continue;
            }

            if let Some(stream) = previous.as_mut() {
                // Advance the previous stream up to `path`
                loop {
                    if let Some(head) = &prev_head {
                        if head.path >= *path {
                            break;
                        }
                    }
                    match stream.next() {
                        Some(record) => {
                            let record = record?;
                            if let Some(last) = &prev_last {
                                if record.path <= *last {
                                    return Err(TreesumError::format(format!(
                                        "previous fingerprint out of order at '{}'",
                                        record.path
                                    )));
                                }
                            }
                            prev_last = Some(record.path.clone());
                            prev_head = Some(record);
                        }
                        None => {
                            prev_head = None;
                            break;
                        }
                    }
                }

                if let Some(head) = &prev_head {
                    if head.path == *path
                        && head.size == entry.size
                        && head.modified == entry.modified
                        && head.kind == entry.kind
                    {
                        if let RecordContent::Digest(digest) = head.content {
                            trace!("Reusing digest for '{}'", path);
                            contents[index] = Some(RecordContent::Digest(digest));
                            stats.files_reused += 1;
                            continue;
                        }
                    }
                }
            }

            jobs.push(HashJob {
                index,
                path: entry.path.clone(),
                size: entry.size,
                kind: entry.kind,
            });
        }

        // Drain the rest so a corrupt tail still aborts the build
        if let Some(stream) = previous {
            for record in stream {
                record?;
            }
        }

        debug!("{} files to hash, {} reused", jobs.len(), stats.files_reused);
        Ok(jobs)
    }

    /// Hash every job on the worker pool and place results by index
    fn hash_all(
        &self,
        jobs: Vec<HashJob>,
        contents: &mut [Option<RecordContent>],
        stats: &mut BuildStats,
        warnings: &mut Vec<ScanWarning>,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }

        let total = jobs.len();
        let total_bytes: u64 = jobs.iter().map(|j| j.size).sum();
        let workers = self.config.workers.max(1).min(total);
        let (job_tx, job_rx) = bounded::<HashJob>(self.config.effective_queue_depth());
        let (result_tx, result_rx) = unbounded::<(usize, PathBuf, Result<FileDigest>)>();

        debug!("Hashing {} files on {} workers", total, workers);

        let mut cancelled = false;
        thread::scope(|scope| -> Result<()> {
            for worker_idx in 0..workers {
                let rx = job_rx.clone();
                let tx = result_tx.clone();
                let hasher = &self.hasher;
                let cancel = &self.cancel;
                thread::Builder::new()
                    .name(format!("treesum-hash-{}", worker_idx))
                    .spawn_scoped(scope, move || {
                        let mut buf = hasher.block_buffer();
                        for job in rx.iter() {
                            if cancel.is_cancelled() {
                                break;
                            }
                            let outcome = hash_job(hasher, &job, cancel, &mut buf);
                            if tx.send((job.index, job.path, outcome)).is_err() {
                                break;
                            }
                        }
                    })?;
            }
            drop(job_rx);
            drop(result_tx);

            let cancel = &self.cancel;
            scope.spawn(move || {
                for job in jobs {
                    if cancel.is_cancelled() || job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            let mut processed = 0usize;
            for (index, path, outcome) in result_rx.iter() {
                processed += 1;
                match outcome {
                    Ok(digest) => {
                        stats.files_hashed += 1;
                        stats.bytes_hashed += digest.bytes;
                        contents[index] = Some(RecordContent::Digest(digest.digest));
                    }
                    Err(TreesumError::Cancelled) => {
                        cancelled = true;
                    }
                    Err(e) => {
                        warn!("Recording {:?} as unreadable: {}", path, e);
                        let mut warning = ScanWarning::from_error(&e);
                        warning.kind = WarningKind::Read;
                        warnings.push(warning);
                        stats.files_unreadable += 1;
                        contents[index] = Some(RecordContent::Unreadable);
                    }
                }

                if let Some(callback) = &self.progress {
                    callback(ProgressInfo {
                        operation: "Hashing".to_string(),
                        current_item: Some(path.to_string_lossy().to_string()),
                        processed,
                        total: Some(total),
                        bytes_processed: stats.bytes_hashed,
                        total_bytes: Some(total_bytes),
                    });
                }
            }
            Ok(())
        })?;

        if cancelled || self.cancel.is_cancelled() {
            info!("Build cancelled");
            return Err(TreesumError::Cancelled);
        }
        Ok(())
    }
}

/// Compute the content identity of one job
fn hash_job(
    hasher: &ContentHasher,
    job: &HashJob,
    cancel: &CancellationToken,
    buf: &mut Vec<u8>,
) -> Result<FileDigest> {
    match job.kind {
        EntryKind::Symlink => {
            let target = utils::read_link_bytes(&job.path)
                .map_err(|e| TreesumError::read(&job.path, e.to_string()))?;
            Ok(FileDigest {
                digest: hasher.hash_bytes(&target),
                bytes: target.len() as u64,
                blocks: None,
            })
        }
        _ => hasher.hash_file(&job.path, job.size, Some(cancel), buf),
    }
}
