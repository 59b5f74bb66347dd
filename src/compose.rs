//! Tarball creation.
//!
//! A [`Composer`] wraps a byte sink with an optional codec and a tar writer.
//! Adding a directory runs a two-party pipeline: the calling thread walks
//! the tree in inode order and produces add-operations, while a dedicated
//! routine drains a bounded FIFO queue and serializes headers and bodies
//! into the tar stream. The queue is the backpressure mechanism; its
//! capacity bounds how many opened file readers are in flight.
//!
//! Headers are written in PAX format so sub-second modification times
//! survive the trip.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;

use crossbeam_channel::{bounded, select, Receiver};
use rustix::fs::FileType;
use tar::EntryType;

use crate::codec::CodecWriter;
use crate::error::ArchiveError;
use crate::options::{Algorithm, ArchiveOption, Level, Role};
use crate::paths;
use crate::stat::{stat, Entry};
use crate::walk::walk;

const DEFAULT_READ_AHEAD: usize = 512;
const COPY_BUF_SIZE: usize = 16 << 20; // 16 MiB

const ZERO_BLOCK: [u8; 512] = [0; 512];

/// A PAX record attached to the next written header.
type PaxRecord = (String, Vec<u8>);

/// A tarball creation context. Create with [`Composer::new`], feed with
/// [`Composer::add`], and always finish with [`Composer::close`].
pub struct Composer<W: Write> {
    builder: tar::Builder<CodecWriter<W>>,
    read_ahead: usize,
    copy_buf: Vec<u8>,
}

impl<W: Write> std::fmt::Debug for Composer<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("read_ahead", &self.read_ahead)
            .field("copy_buf_len", &self.copy_buf.len())
            .finish()
    }
}

struct AddOperation {
    header: tar::Header,
    pax: Vec<PaxRecord>,
    reader: Option<File>,
}

impl<W: Write> Composer<W> {
    /// Creates a composer writing the tarball to `sink`, applying `options`.
    ///
    /// The sink stays owned by the composer until [`Composer::close`]
    /// returns it; closing the raw sink remains the caller's job.
    pub fn new(sink: W, options: &[ArchiveOption]) -> Result<Self, ArchiveError> {
        let mut algorithm = Algorithm::None;
        let mut level = Level::Default;
        let mut read_ahead = DEFAULT_READ_AHEAD;
        for opt in options {
            opt.check(Role::Composer)?;
            match *opt {
                ArchiveOption::Compression(a) => algorithm = a,
                ArchiveOption::CompressionLevel(l) => level = l,
                ArchiveOption::ReadAhead(n) => read_ahead = n,
                // Rejected by the role check above.
                ArchiveOption::Thread(_) | ArchiveOption::Threshold(_) => {}
            }
        }
        let codec = CodecWriter::new(sink, algorithm, level)?;
        Ok(Composer {
            builder: tar::Builder::new(codec),
            read_ahead,
            copy_buf: vec![0u8; COPY_BUF_SIZE],
        })
    }

    /// Adds a file or a subtree to the tarball.
    ///
    /// If `path` names a non-directory, the single object is added under
    /// `base/<basename>`. If it names a directory, every descendant is
    /// added under `base/<basename>/…`, visited in inode order per
    /// directory, depth first.
    pub fn add(&mut self, path: impl AsRef<Path>, base: impl AsRef<Path>) -> Result<(), ArchiveError> {
        let path = path.as_ref();
        let base = base.as_ref();
        let entry = stat(path)?;
        if !entry.is_dir() {
            let name = base.join(entry.name());
            let (header, pax) = tar_header_from_entry(&name, &entry)?;
            let reader = match entry.is_file() {
                true => Some(File::open(path).map_err(|e| ArchiveError::io(e, path))?),
                false => None,
            };
            return write_operation(
                &mut self.builder,
                &mut self.copy_buf,
                AddOperation { header, pax, reader },
            );
        }

        let abs = std::path::absolute(path).map_err(|e| ArchiveError::io(e, path))?;
        let dir_base = abs
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let (op_tx, op_rx) = bounded::<AddOperation>(self.read_ahead);
        let (err_tx, err_rx) = bounded::<ArchiveError>(1);
        let late_err_rx = err_rx.clone();

        let builder = &mut self.builder;
        let copy_buf = &mut self.copy_buf;
        let walk_result = thread::scope(|s| {
            // The walker runs on its own thread; the tar writer stays here
            // so the codec state never crosses threads.
            let walker = s.spawn(move || {
                walk(&abs, |file_path, entry, reader| {
                    let rel = file_path.strip_prefix(&dir_base).map_err(|_| {
                        ArchiveError::InvalidArgument(format!(
                            "walked path {} escapes {}",
                            file_path.display(),
                            dir_base.display()
                        ))
                    })?;
                    let name = base.join(rel);
                    let (header, pax) = tar_header_from_entry(&name, &entry)?;
                    let op = AddOperation { header, pax, reader };
                    select! {
                        send(op_tx, op) -> result => {
                            if result.is_err() {
                                return Err(take_error(&err_rx));
                            }
                            Ok(())
                        }
                        recv(err_rx) -> msg => Err(msg.unwrap_or_else(|_| pipeline_broken())),
                    }
                })
            });

            for op in op_rx.iter() {
                if let Err(err) = write_operation(builder, copy_buf, op) {
                    let _ = err_tx.send(err);
                    break;
                }
            }
            // After a failure the queue must still be drained so every
            // in-flight body reader is closed.
            for op in op_rx.iter() {
                drop(op.reader);
            }
            walker.join().unwrap_or_else(|_| Err(pipeline_broken()))
        });
        walk_result?;
        // The writer may have failed after the walker already finished.
        match late_err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// The underlying tar writer, for callers that splice raw headers and
    /// bodies themselves. It must not be closed through this reference.
    pub fn tar_writer(&mut self) -> &mut tar::Builder<CodecWriter<W>> {
        &mut self.builder
    }

    /// Completes the tarball: writes the tar trailer, flushes the codec
    /// framing, and hands the raw sink back. Must be called.
    pub fn close(self) -> Result<W, ArchiveError> {
        let codec = self.builder.into_inner()?;
        Ok(codec.finish()?)
    }
}

fn take_error(err_rx: &Receiver<ArchiveError>) -> ArchiveError {
    err_rx.try_recv().unwrap_or_else(|_| pipeline_broken())
}

fn pipeline_broken() -> ArchiveError {
    ArchiveError::from(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "tar writer routine stopped unexpectedly",
    ))
}

fn writer_context(header: &tar::Header) -> PathBuf {
    PathBuf::from(std::ffi::OsStr::from_bytes(&header.path_bytes()))
}

/// Serializes one operation: PAX records, then the header block, then the
/// body copied through the reusable buffer, padded to the 512-byte grid.
fn write_operation<W: Write>(
    builder: &mut tar::Builder<CodecWriter<W>>,
    copy_buf: &mut [u8],
    op: AddOperation,
) -> Result<(), ArchiveError> {
    let AddOperation { header, pax, reader } = op;
    let ctx = writer_context(&header);
    if !pax.is_empty() {
        builder
            .append_pax_extensions(pax.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
            .map_err(|e| ArchiveError::io(e, &ctx))?;
    }
    let out = builder.get_mut();
    out.write_all(header.as_bytes())
        .map_err(|e| ArchiveError::io(e, &ctx))?;
    let Some(mut file) = reader else {
        return Ok(());
    };
    let size = header.entry_size().map_err(|e| ArchiveError::io(e, &ctx))?;
    let mut remaining = size;
    while remaining > 0 {
        let want = remaining.min(copy_buf.len() as u64) as usize;
        let n = match file.read(&mut copy_buf[..want]) {
            Ok(0) => {
                return Err(ArchiveError::io(
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while being archived",
                    ),
                    &ctx,
                ))
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ArchiveError::io(e, &ctx)),
        };
        out.write_all(&copy_buf[..n])
            .map_err(|e| ArchiveError::io(e, &ctx))?;
        remaining -= n as u64;
    }
    let pad = (512 - (size % 512) as usize) % 512;
    if pad > 0 {
        out.write_all(&ZERO_BLOCK[..pad])
            .map_err(|e| ArchiveError::io(e, &ctx))?;
    }
    Ok(())
}

/// Builds a PAX-format tar header for an entry, with the archive name run
/// through path validation. Values that exceed the ustar fields spill into
/// PAX records.
fn tar_header_from_entry(
    name: &Path,
    entry: &Entry,
) -> Result<(tar::Header, Vec<PaxRecord>), ArchiveError> {
    let bytes = name.as_os_str().as_bytes();
    let trimmed = paths::trim_leading_slashes(bytes);
    paths::validate_rel_path(trimmed)?;
    let rel = Path::new(std::ffi::OsStr::from_bytes(trimmed));

    let entry_type = match entry.file_type() {
        FileType::RegularFile => EntryType::Regular,
        FileType::Directory => EntryType::Directory,
        FileType::Symlink => EntryType::Symlink,
        FileType::Fifo => return Err(ArchiveError::UnsupportedFileType { flag: b'6' }),
        FileType::CharacterDevice => return Err(ArchiveError::UnsupportedFileType { flag: b'3' }),
        FileType::BlockDevice => return Err(ArchiveError::UnsupportedFileType { flag: b'4' }),
        FileType::Socket | FileType::Unknown => {
            return Err(ArchiveError::UnsupportedFileType { flag: b'?' })
        }
    };

    let mut header = tar::Header::new_ustar();
    let mut pax: Vec<PaxRecord> = Vec::new();
    header.set_entry_type(entry_type);
    header.set_mode(entry.permissions());
    header.set_uid(entry.uid() as u64);
    header.set_gid(entry.gid() as u64);
    header.set_size(match entry_type {
        EntryType::Regular => entry.size(),
        _ => 0,
    });
    header.set_mtime(entry.mtime_sec().max(0) as u64);
    if entry.mtime_nsec() != 0 || entry.mtime_sec() < 0 {
        // The ustar field holds whole non-negative seconds only;
        // sub-second and pre-epoch times ride in a PAX record.
        pax.push((
            "mtime".to_string(),
            format_pax_time(entry.mtime_sec(), entry.mtime_nsec()).into_bytes(),
        ));
    }
    if header.set_path(rel).is_err() {
        pax.push(("path".to_string(), trimmed.to_vec()));
        header
            .set_path(short_name(trimmed))
            .map_err(|e| ArchiveError::io(e, rel))?;
    }
    if entry_type == EntryType::Symlink {
        let target = entry.link_target().unwrap_or_else(|| Path::new(""));
        if header.set_link_name(target).is_err() {
            pax.push((
                "linkpath".to_string(),
                target.as_os_str().as_bytes().to_vec(),
            ));
        }
    }
    if header.set_username(entry.uname()).is_err() {
        pax.push(("uname".to_string(), entry.uname().as_bytes().to_vec()));
    }
    if header.set_groupname(entry.gname()).is_err() {
        pax.push(("gname".to_string(), entry.gname().as_bytes().to_vec()));
    }
    header.set_cksum();
    Ok((header, pax))
}

/// Formats a timestamp as a PAX time value, `seconds[.fraction]`. The
/// kernel keeps nanoseconds as a non-negative offset even before the
/// epoch, so negative times fold the fraction into the sign.
fn format_pax_time(sec: i64, nsec: u32) -> String {
    if nsec == 0 {
        return sec.to_string();
    }
    if sec >= 0 {
        return format!("{}.{:09}", sec, nsec);
    }
    format!("-{}.{:09}", -(sec + 1), 1_000_000_000 - nsec)
}

/// A name that fits the 100-byte ustar field, used as the fallback when the
/// real name lives in a PAX record.
fn short_name(bytes: &[u8]) -> &std::ffi::OsStr {
    let base = bytes.rsplit(|&b| b == b'/').next().unwrap_or(bytes);
    std::ffi::OsStr::from_bytes(&base[..base.len().min(100)])
}
