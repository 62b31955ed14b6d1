//! # treesum CLI - fingerprint and compare file trees
//!
//! Command-line front end for the treesum library.
//!
//! ## Features
//! - Scan a directory into a fingerprint artifact, reusing digests from a
//!   previous scan
//! - Diff two fingerprints, optionally pairing renamed files
//! - Verify artifact integrity
//! - Check a live tree against a stored fingerprint
//!
//! ## Usage
//! ```bash
//! # Fingerprint a tree
//! treesum scan /data -o monday.tsum
//!
//! # Rescan, trusting unchanged metadata from the last run
//! treesum scan /data -o tuesday.tsum --previous monday.tsum --trust-metadata
//!
//! # What changed?
//! treesum diff monday.tsum tuesday.tsum --renames
//!
//! # Does the tree still match?
//! treesum check /data tuesday.tsum
//! ```
//!
//! `diff` and `check` exit with 0 when both sides match, 1 when they
//! differ and 2 on error. Every other command exits with 0 or 2.

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use treesum::utils::format_bytes;
use treesum::{
    BuildConfig, Compression, DiffEntry, DiffSummary, DigestAlgorithm, FingerprintBuilder,
    FingerprintFile, ProgressInfo, RecordContent, RenameClassifier, RenameConfig, Result,
    SymlinkPolicy, TrustPolicy, WarningKind,
};

/// Exit status for identical fingerprints and successful commands
const EXIT_OK: i32 = 0;
/// Exit status when `diff` or `check` found differences
const EXIT_DIFFERENT: i32 = 1;
/// Exit status on any error
const EXIT_ERROR: i32 = 2;

/// treesum - comparable fingerprints of large file trees
#[derive(Parser)]
#[command(name = "treesum")]
#[command(version)]
#[command(about = "Fingerprint directory trees and compare them without keeping both around")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fingerprint a directory tree
    Scan {
        /// Directory to scan
        root: PathBuf,

        /// Artifact to write
        #[arg(short, long)]
        output: PathBuf,

        /// Previous fingerprint of the same tree, for digest reuse
        #[arg(short, long)]
        previous: Option<PathBuf>,

        /// JSON configuration file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Digest algorithm
        #[arg(short, long, value_enum)]
        algorithm: Option<AlgorithmArg>,

        /// Reuse digests of files whose size and mtime are unchanged
        #[arg(long)]
        trust_metadata: bool,

        /// Hashing block size in bytes
        #[arg(long)]
        block_size: Option<usize>,

        /// Number of hashing threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// LZ4-compress the record section
        #[arg(long)]
        compress: bool,

        /// Omit the integrity trailer
        #[arg(long)]
        no_trailer: bool,

        /// Follow symbolic links instead of recording them
        #[arg(long)]
        follow_symlinks: bool,

        /// Exclude paths matching a glob (repeatable)
        #[arg(short, long)]
        exclude: Vec<String>,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Compare two fingerprints
    Diff {
        /// Older fingerprint
        old: PathBuf,

        /// Newer fingerprint
        new: PathBuf,

        /// Pair removed and added files with identical content
        #[arg(short, long)]
        renames: bool,

        /// Smallest file size considered for rename pairing
        #[arg(long, default_value_t = 1)]
        min_rename_size: u64,

        /// Also list unchanged paths
        #[arg(short, long)]
        unchanged: bool,

        /// Emit one JSON object per entry
        #[arg(long)]
        json: bool,
    },

    /// Validate a fingerprint artifact
    Verify {
        /// Fingerprint to validate
        file: PathBuf,
    },

    /// Print a fingerprint's header and records
    Show {
        /// Fingerprint to print
        file: PathBuf,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,

        /// Emit one JSON object per record
        #[arg(long)]
        json: bool,
    },

    /// Re-hash a tree and compare it with a stored fingerprint
    Check {
        /// Directory to check
        root: PathBuf,

        /// Fingerprint to check against
        file: PathBuf,

        /// JSON configuration file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of hashing threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Follow symbolic links; use the same setting as the scan
        #[arg(long)]
        follow_symlinks: bool,

        /// Exclude paths matching a glob (repeatable); use the same globs as the scan
        #[arg(short, long)]
        exclude: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgorithmArg {
    Sha256,
    Blake3,
}

impl From<AlgorithmArg> for DigestAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Sha256 => DigestAlgorithm::Sha256,
            AlgorithmArg::Blake3 => DigestAlgorithm::Blake3,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(EXIT_ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Scan {
            root,
            output,
            previous,
            config,
            algorithm,
            trust_metadata,
            block_size,
            workers,
            compress,
            no_trailer,
            follow_symlinks,
            exclude,
            progress,
        } => {
            let mut build_config = walk_config(config, workers, follow_symlinks, exclude)?;
            if let Some(algorithm) = algorithm {
                build_config.algorithm = algorithm.into();
            }
            if trust_metadata {
                build_config.trust = TrustPolicy::TrustMetadata;
            }
            if let Some(block_size) = block_size {
                build_config.block_size = block_size;
            }
            if compress {
                build_config.compression = Compression::Lz4;
            }
            if no_trailer {
                build_config.trailer = false;
            }

            cmd_scan(root, output, previous, build_config, progress).map(|_| EXIT_OK)
        }
        Commands::Diff {
            old,
            new,
            renames,
            min_rename_size,
            unchanged,
            json,
        } => cmd_diff(&old, &new, renames.then_some(RenameConfig { min_size: min_rename_size }), unchanged, json),
        Commands::Verify { file } => cmd_verify(&file).map(|_| EXIT_OK),
        Commands::Show { file, limit, json } => cmd_show(&file, limit, json).map(|_| EXIT_OK),
        Commands::Check {
            root,
            file,
            config,
            workers,
            follow_symlinks,
            exclude,
        } => {
            let build_config = walk_config(config, workers, follow_symlinks, exclude)?;
            cmd_check(root, &file, build_config)
        }
    }
}

/// Settings shared by `scan` and `check`
///
/// `check` must walk the tree the way the scan did, otherwise excluded or
/// followed paths show up as extra or missing.
fn walk_config(
    config: Option<PathBuf>,
    workers: Option<usize>,
    follow_symlinks: bool,
    exclude: Vec<String>,
) -> Result<BuildConfig> {
    let mut build_config = match config {
        Some(path) => BuildConfig::from_json_file(&path)?,
        None => BuildConfig::default(),
    };
    if let Some(workers) = workers {
        build_config.workers = workers;
    }
    if follow_symlinks {
        build_config.symlinks = SymlinkPolicy::Follow;
    }
    build_config.exclude.extend(exclude);
    Ok(build_config)
}

/// Build a fingerprint and write it to `output`
fn cmd_scan(
    root: PathBuf,
    output: PathBuf,
    previous: Option<PathBuf>,
    config: BuildConfig,
    show_progress: bool,
) -> Result<()> {
    println!("{} {}", "Scanning".blue().bold(), root.display());

    let start = Instant::now();
    let mut builder = FingerprintBuilder::new(&root, config)?;

    let bar = if show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        let callback_bar = pb.clone();
        builder = builder.with_progress(Arc::new(move |info: ProgressInfo| {
            if let Some(total) = info.total {
                callback_bar.set_length(total as u64);
            }
            callback_bar.set_position(info.processed as u64);
            let percent = info.percentage().unwrap_or(0.0);
            callback_bar.set_message(format!("{:.0}% {}", percent, format_bytes(info.bytes_processed)));
        }));
        Some(pb)
    } else {
        None
    };

    let result = builder.build_to_file(&output, previous.as_deref());

    if let Some(pb) = bar {
        pb.finish_and_clear();
    }
    let (outcome, summary) = result?;
    let stats = &outcome.stats;

    println!(
        "{} Wrote {}",
        "✓".green().bold(),
        output.display().to_string().yellow().bold()
    );
    println!("  Records: {}", stats.records.to_string().cyan());
    println!("  Size: {}", format_bytes(outcome.fingerprint.total_size()).cyan());
    println!(
        "  Hashed: {} files ({})",
        stats.files_hashed.to_string().cyan(),
        format_bytes(stats.bytes_hashed)
    );
    if stats.files_reused > 0 {
        println!("  Reused: {} files", stats.files_reused.to_string().cyan());
    }
    println!("  Tree digest: {}", summary.tree_digest.to_hex().dimmed());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());

    if !outcome.warnings.is_empty() {
        println!(
            "\n{} {} warnings",
            "⚠".yellow().bold(),
            outcome.warnings.len().to_string().yellow()
        );
        for warning in &outcome.warnings {
            let label = match warning.kind {
                WarningKind::Walk => "skipped",
                WarningKind::Read => "unreadable",
                WarningKind::DuplicatePath => "duplicate",
            };
            println!("  {} {}: {}", label.yellow(), warning.path.display(), warning.message.dimmed());
        }
    }

    Ok(())
}

/// Stream the differences between two fingerprints
fn cmd_diff(
    old_path: &Path,
    new_path: &Path,
    renames: Option<RenameConfig>,
    show_unchanged: bool,
    json: bool,
) -> Result<i32> {
    let old = FingerprintFile::open_verified(old_path)?;
    let new = FingerprintFile::open_verified(new_path)?;

    if treesum::check_comparable(old.header(), new.header()).is_err() {
        eprintln!(
            "{} fingerprints use different algorithms ({} vs {}); every file will compare as modified",
            "Warning:".yellow().bold(),
            old.header().algorithm,
            new.header().algorithm
        );
    }

    let mut summary = DiffSummary::default();
    let mut classifier = renames.map(RenameClassifier::new);

    let mut emit = |entry: DiffEntry| -> Result<()> {
        summary.record(&entry);
        if matches!(entry, DiffEntry::Unchanged { .. }) && !show_unchanged {
            return Ok(());
        }
        if json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            print_entry(&entry);
        }
        Ok(())
    };

    for entry in treesum::diff(old.records()?, new.records()?) {
        let entry = entry?;
        let passthrough = match classifier.as_mut() {
            Some(classifier) => classifier.observe(entry),
            None => Some(entry),
        };
        if let Some(entry) = passthrough {
            emit(entry)?;
        }
    }
    if let Some(classifier) = classifier {
        for entry in classifier.finish() {
            emit(entry)?;
        }
    }

    if !json {
        println!("\n{}", summary.to_string().bold());
        if summary.bytes_added > 0 || summary.bytes_removed > 0 {
            println!(
                "  {} / {}",
                format!("+{}", format_bytes(summary.bytes_added)).green(),
                format!("-{}", format_bytes(summary.bytes_removed)).red()
            );
        }
    }

    Ok(if summary.has_changes() { EXIT_DIFFERENT } else { EXIT_OK })
}

fn print_entry(entry: &DiffEntry) {
    match entry {
        DiffEntry::Added { record } => println!("{} {}", "+".green().bold(), record.path.as_str().green()),
        DiffEntry::Removed { record } => println!("{} {}", "-".red().bold(), record.path.as_str().red()),
        DiffEntry::Modified { new, change, .. } => println!(
            "{} {} {}",
            "~".yellow().bold(),
            new.path.as_str().yellow(),
            format!("({:?})", change).dimmed()
        ),
        DiffEntry::Moved { from, to } => println!(
            "{} {} -> {}",
            ">".blue().bold(),
            from.path.as_str(),
            to.path.as_str().blue()
        ),
        DiffEntry::Unchanged { path } => println!("  {}", path.as_str().dimmed()),
    }
}

/// Check an artifact's structure and trailer
fn cmd_verify(file: &Path) -> Result<()> {
    let start = Instant::now();
    let artifact = FingerprintFile::open_verified(file)?;
    let summary = artifact.summary();

    println!("{} {} is valid", "✓".green().bold(), file.display().to_string().yellow());
    println!("  Records: {}", summary.records.to_string().cyan());
    println!("  Tree digest: {}", summary.tree_digest.to_hex().dimmed());
    if summary.trailer_verified {
        println!("  Trailer: {}", "verified".green());
    } else {
        println!("  Trailer: {}", "absent (structure checked only)".yellow());
    }
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    Ok(())
}

/// Print header and records of an artifact
fn cmd_show(file: &Path, limit: Option<usize>, json: bool) -> Result<()> {
    let artifact = FingerprintFile::open_verified(file)?;
    let header = artifact.header();

    if !json {
        println!("{} {}", "Fingerprint".blue().bold(), file.display().to_string().yellow().bold());
        println!("  Root: {}", header.root);
        println!("  Created: {}", header.created_at.format("%Y-%m-%d %H:%M:%S"));
        println!("  Algorithm: {}", header.algorithm.to_string().cyan());
        println!("  Block size: {}", format_bytes(header.block_size as u64));
        println!("  Compression: {:?}", header.compression);
        println!("  Records: {}", artifact.summary().records.to_string().cyan());
        println!();
    }

    let limit = limit.unwrap_or(usize::MAX);
    for record in artifact.records()?.take(limit) {
        let record = record?;
        if json {
            println!("{}", serde_json::to_string(&record)?);
            continue;
        }
        let content = match &record.content {
            RecordContent::Digest(digest) => digest.to_hex()[..16].to_string(),
            RecordContent::Unreadable => "unreadable".red().to_string(),
            RecordContent::Absent => "-".dimmed().to_string(),
        };
        println!(
            "{:>16}  {:>10}  {}  {}",
            content,
            format_bytes(record.size),
            record.modified.format("%Y-%m-%d %H:%M"),
            record.path
        );
    }
    Ok(())
}

/// Verify a live tree against a fingerprint
fn cmd_check(root: PathBuf, file: &Path, config: BuildConfig) -> Result<i32> {
    println!("{} {} against {}", "Checking".blue().bold(), root.display(), file.display());

    let report = treesum::verify_tree(&root, file, config)?;

    if report.is_clean() {
        println!("{} {}", "✓".green().bold(), report.summary());
        return Ok(EXIT_OK);
    }

    println!("{} {}", "✗".red().bold(), report.summary());
    for path in &report.missing {
        println!("  {} {}", "missing".red(), path);
    }
    for path in &report.extra {
        println!("  {} {}", "extra".yellow(), path);
    }
    for path in &report.mismatched {
        println!("  {} {}", "mismatch".red().bold(), path);
    }
    for path in &report.unreadable {
        println!("  {} {}", "unreadable".yellow(), path);
    }
    Ok(EXIT_DIFFERENT)
}
