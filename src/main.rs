//! Command-line interface for the partar archiver.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use partar::{resolve, Algorithm, ArchiveOption, Composer, Level};

#[derive(Parser, Debug)]
#[command(name = "partar", version, about = "Parallel tar archiver tuned for trees of small files", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an archive from one or more source paths.
    #[command(alias = "c")]
    Create {
        /// The archive file to write.
        archive: PathBuf,

        /// Files or directories to add to the archive.
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Compression algorithm (gzip or lz4; empty for none).
        #[arg(short = 'c', long = "compression", default_value = "")]
        compression: Algorithm,

        /// Compression level (fastest, fast, default, good, best).
        #[arg(short = 'l', long, default_value = "default")]
        level: Level,

        /// Number of files to read ahead of the tar writer.
        #[arg(short = 'r', long = "read-ahead", default_value_t = 512)]
        read_ahead: usize,
    },

    /// Extract an archive.
    #[command(alias = "x")]
    Extract {
        /// The archive file to read.
        archive: PathBuf,

        /// Target directory for the extracted tree.
        #[arg(short = 'd', long = "dir", default_value = ".")]
        dir: PathBuf,

        /// Compression algorithm (gzip or lz4; empty for none).
        #[arg(short = 'c', long = "compression", default_value = "")]
        compression: Algorithm,

        /// Number of writer threads.
        #[arg(short = 't', long, default_value_t = 4)]
        threads: usize,

        /// Buffered-write threshold in KiB; larger files are written
        /// inline on the reader thread.
        #[arg(short = 's', long, default_value_t = 512)]
        threshold: u64,

        /// Number of entries to read ahead of the writer threads.
        #[arg(short = 'r', long = "read-ahead", default_value_t = 1024)]
        read_ahead: usize,
    },
}

fn main() -> ExitCode {
    // Walking keeps one descriptor per directory depth plus every read-ahead
    // file open; run with the largest descriptor budget available.
    raise_fd_limit();
    if let Err(e) = run_app() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_app() -> Result<(), Box<dyn std::error::Error>> {
    match Args::parse().command {
        Commands::Create { archive, sources, compression, level, read_ahead } => {
            create(&archive, &sources, compression, level, read_ahead)
        }
        Commands::Extract { archive, dir, compression, threads, threshold, read_ahead } => {
            extract(&archive, &dir, compression, threads, threshold, read_ahead)
        }
    }
}

fn create(
    archive: &Path,
    sources: &[PathBuf],
    compression: Algorithm,
    level: Level,
    read_ahead: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "creating {} from {} source(s), compression: {}, level: {}, read ahead: {}",
        archive.display(),
        sources.len(),
        compression,
        level,
        read_ahead
    );
    let sink = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(archive)?;
    let options = [
        ArchiveOption::Compression(compression),
        ArchiveOption::CompressionLevel(level),
        ArchiveOption::ReadAhead(read_ahead),
    ];
    let mut composer = Composer::new(sink, &options)?;
    for source in sources {
        let base = source.parent().unwrap_or_else(|| Path::new(""));
        composer.add(source, base)?;
    }
    composer.close()?;
    Ok(())
}

fn extract(
    archive: &Path,
    dir: &Path,
    compression: Algorithm,
    threads: usize,
    threshold_kib: u64,
    read_ahead: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    println!(
        "extracting {} to {}, compression: {}, threads: {}, threshold: {} KiB, read ahead: {}",
        archive.display(),
        dir.display(),
        compression,
        threads,
        threshold_kib,
        read_ahead
    );
    let source = File::open(archive)?;
    let options = [
        ArchiveOption::Compression(compression),
        ArchiveOption::Thread(threads),
        ArchiveOption::Threshold(threshold_kib << 10),
        ArchiveOption::ReadAhead(read_ahead),
    ];
    resolve(source, dir, &options)?;
    Ok(())
}

/// Raises the soft open-file limit to the hard limit, best-effort.
fn raise_fd_limit() {
    use rustix::process::{getrlimit, setrlimit, Resource};
    let mut limit = getrlimit(Resource::Nofile);
    if limit.current != limit.maximum {
        limit.current = limit.maximum;
        let _ = setrlimit(Resource::Nofile, limit);
    }
}
