//! Tarball extraction.
//!
//! [`resolve`] runs a single pass over the tar stream. The calling thread
//! owns the tar reader and classifies every entry: small regular files are
//! buffered into pooled byte buffers and handed to one of N writer workers
//! over a bounded FIFO queue; regular files above the size threshold are
//! written inline on the reader thread, trading some writer contention for
//! not buffering gigabytes. Non-regular entries travel as bodyless
//! operations.
//!
//! A failing worker publishes its error, raises a one-shot cancel signal,
//! and exits; the reader observes the signal at its next enqueue and stops.

use std::fs::{self, FileTimes, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tar::EntryType;

use crate::codec::CodecReader;
use crate::error::ArchiveError;
use crate::options::{Algorithm, ArchiveOption, Role};
use crate::paths;
use crate::pool::BufferPool;
use crate::sys;

const DEFAULT_THREAD: usize = 4;
const DEFAULT_READ_AHEAD: usize = 1024;
const DEFAULT_THRESHOLD: u64 = 512 << 10; // 512 KiB

/// Extraction context shared by the reader and the workers.
struct Resolver {
    target: PathBuf,
    threshold: u64,
    pool: BufferPool,
    /// Recorded directory modes, applied only after the whole stream has
    /// been materialized; see `apply_dir_modes`.
    dir_modes: Mutex<Vec<(PathBuf, u32)>>,
}

/// An owned snapshot of one tar header, PAX records already folded in.
/// A negative nanosecond offset points further into the past, mirroring
/// the sign of a negative PAX time's fraction.
struct EntryMeta {
    name: Vec<u8>,
    entry_type: EntryType,
    size: u64,
    mode: u32,
    mtime_sec: i64,
    mtime_nsec: i32,
    atime: Option<(i64, i32)>,
    link_target: Option<PathBuf>,
}

/// An unfinished extract operation: a header snapshot plus, for buffered
/// regular files, the body borrowed from the pool.
struct ExtractOperation {
    meta: EntryMeta,
    body: Option<Vec<u8>>,
}

/// One-shot broadcast used to stop the reader after a worker fails.
/// Cancelling drops the sender, which closes the channel for every
/// receiver; racing workers cancel at most once.
struct CancelSignal {
    tx: Mutex<Option<Sender<()>>>,
}

impl CancelSignal {
    fn new(tx: Sender<()>) -> Self {
        CancelSignal { tx: Mutex::new(Some(tx)) }
    }

    fn cancel(&self) {
        self.tx.lock().unwrap().take();
    }
}

/// Extracts a tarball (optionally compressed) from `source` into
/// `target_dir`, applying `options`. Leading slashes in entry names are
/// trimmed and path traversal is rejected; nothing is ever written outside
/// `target_dir`.
///
/// The call runs the complete extraction to completion or to the first
/// error.
pub fn resolve<R: Read>(
    source: R,
    target_dir: impl AsRef<Path>,
    options: &[ArchiveOption],
) -> Result<(), ArchiveError> {
    let mut algorithm = Algorithm::None;
    let mut thread_count = DEFAULT_THREAD;
    let mut read_ahead = DEFAULT_READ_AHEAD;
    let mut threshold = DEFAULT_THRESHOLD;
    for opt in options {
        opt.check(Role::Resolver)?;
        match *opt {
            ArchiveOption::Compression(a) => algorithm = a,
            ArchiveOption::Thread(n) => thread_count = n,
            ArchiveOption::ReadAhead(n) => read_ahead = n,
            ArchiveOption::Threshold(n) => threshold = n,
            // Rejected by the role check above.
            ArchiveOption::CompressionLevel(_) => {}
        }
    }

    let reader = CodecReader::new(source, algorithm)?;
    let mut archive = tar::Archive::new(reader);
    let resolver = Resolver {
        target: target_dir.as_ref().to_path_buf(),
        threshold,
        pool: BufferPool::new(threshold as usize),
        dir_modes: Mutex::new(Vec::new()),
    };

    let (op_tx, op_rx) = bounded::<ExtractOperation>(read_ahead);
    let (err_tx, err_rx) = bounded::<ArchiveError>(thread_count);
    let (cancel_tx, cancel_rx) = bounded::<()>(0);
    let cancel = CancelSignal::new(cancel_tx);

    let read_result = thread::scope(|s| {
        for _ in 0..thread_count {
            let op_rx = op_rx.clone();
            let err_tx = err_tx.clone();
            let resolver = &resolver;
            let cancel = &cancel;
            s.spawn(move || worker_loop(resolver, op_rx, err_tx, cancel));
        }
        let result = read_stream(&resolver, &mut archive, &op_tx, &cancel_rx);
        drop(op_tx);
        result
        // Workers are joined as the scope ends.
    });
    // Only now that every descendant exists can recorded directory modes
    // be applied; a read-only directory would have blocked its children.
    resolver.apply_dir_modes();
    read_result?;
    match err_rx.try_recv() {
        Ok(err) => Err(err),
        Err(_) => Ok(()),
    }
}

/// Scans the tar stream, classifying every entry against the threshold.
/// Returns on stream end, on a read or inline-write error, or when the
/// cancel signal fires.
fn read_stream<R: Read>(
    res: &Resolver,
    archive: &mut tar::Archive<CodecReader<R>>,
    op_tx: &Sender<ExtractOperation>,
    cancel_rx: &Receiver<()>,
) -> Result<(), ArchiveError> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let meta = entry_meta(&mut entry)?;
        let mut body = None;
        if meta.entry_type == EntryType::Regular {
            if meta.size > res.threshold {
                // Too big to buffer; write it on this thread.
                res.write_entry(&meta, Some(&mut entry))?;
                continue;
            }
            let mut buf = res.pool.get();
            if let Err(e) = entry.read_to_end(&mut buf) {
                res.pool.put(buf);
                return Err(ArchiveError::io(e, meta.context_path()));
            }
            body = Some(buf);
        }
        let op = ExtractOperation { meta, body };
        select! {
            send(op_tx, op) -> result => {
                if result.is_err() {
                    return Ok(());
                }
            }
            recv(cancel_rx) -> _ => return Ok(()),
        }
    }
    Ok(())
}

/// Drains buffered operations until the queue closes. On error, publishes
/// it, raises the cancel signal, and exits.
fn worker_loop(
    res: &Resolver,
    op_rx: Receiver<ExtractOperation>,
    err_tx: Sender<ArchiveError>,
    cancel: &CancelSignal,
) {
    for op in op_rx.iter() {
        let ExtractOperation { meta, body } = op;
        let result = match body {
            Some(buf) => {
                let mut slice: &[u8] = &buf;
                let result = res.write_entry(&meta, Some(&mut slice));
                res.pool.put(buf);
                result
            }
            None => res.write_entry(&meta, None),
        };
        if let Err(err) = result {
            let _ = err_tx.send(err);
            cancel.cancel();
            return;
        }
    }
}

impl Resolver {
    /// Materializes one entry under the target directory. Mode and time
    /// restoration is best-effort; some filesystems reject them.
    fn write_entry(&self, meta: &EntryMeta, body: Option<&mut dyn Read>) -> Result<(), ArchiveError> {
        let name = paths::trim_leading_slashes(&meta.name);
        paths::validate_rel_path(name)?;
        let target = self.target.join(Path::new(std::ffi::OsStr::from_bytes(name)));
        match meta.entry_type {
            EntryType::Directory => {
                // Created with the default umask-filtered mode. The
                // recorded mode is deferred: a directory entry precedes
                // its children in the stream, and a restrictive mode
                // applied now would make every child write fail.
                fs::create_dir_all(&target).map_err(|e| ArchiveError::io(e, &target))?;
                self.dir_modes.lock().unwrap().push((target, meta.mode));
            }
            EntryType::Symlink | EntryType::Link => {
                // Hard links are materialized as symlinks: their target may
                // not have been written yet at this point of the stream.
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
                }
                let link_target = meta.link_target.clone().unwrap_or_default();
                if let Err(err) = symlink(&link_target, &target) {
                    if err.kind() != io::ErrorKind::AlreadyExists {
                        return Err(ArchiveError::io(err, &target));
                    }
                    let _ = fs::remove_file(&target);
                    symlink(&link_target, &target).map_err(|e| ArchiveError::io(e, &target))?;
                }
                let _ = sys::chmod_symlink(&target, meta.mode);
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| ArchiveError::io(e, parent))?;
                }
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .mode(meta.mode)
                    .open(&target)
                    .map_err(|e| ArchiveError::io(e, &target))?;
                if let Some(body) = body {
                    io::copy(body, &mut file).map_err(|e| ArchiveError::io(e, &target))?;
                }
                let _ = file.set_permissions(fs::Permissions::from_mode(meta.mode));
                let _ = file.set_times(meta.file_times());
            }
            other => {
                return Err(ArchiveError::UnsupportedFileType { flag: other.as_byte() });
            }
        }
        Ok(())
    }

    /// Applies the recorded directory modes, children before parents so a
    /// read-only parent cannot lock out the chmod of its own subtree.
    /// Best-effort, like every other mode restoration.
    fn apply_dir_modes(&self) {
        let mut dirs = self.dir_modes.lock().unwrap();
        dirs.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (path, mode) in dirs.drain(..) {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(mode));
        }
    }
}

/// Snapshots a tar entry's header, folding in the PAX records the base
/// header cannot carry (sub-second times, long names handled by the tar
/// reader itself).
fn entry_meta<R: Read>(entry: &mut tar::Entry<R>) -> Result<EntryMeta, ArchiveError> {
    let name = entry.path_bytes().into_owned();
    let ctx = PathBuf::from(std::ffi::OsStr::from_bytes(&name));
    let (entry_type, size, mode, mut mtime_sec) = {
        let header = entry.header();
        (
            header.entry_type(),
            header.entry_size().map_err(|e| ArchiveError::io(e, &ctx))?,
            header.mode().map_err(|e| ArchiveError::io(e, &ctx))?,
            header.mtime().map_err(|e| ArchiveError::io(e, &ctx))? as i64,
        )
    };
    let link_target = entry
        .link_name_bytes()
        .map(|b| PathBuf::from(std::ffi::OsStr::from_bytes(&b)));
    let mut mtime_nsec = 0;
    let mut atime = None;
    if let Ok(Some(extensions)) = entry.pax_extensions() {
        for ext in extensions.flatten() {
            match ext.key() {
                Ok("mtime") => {
                    if let Some((sec, nsec)) = parse_pax_time(ext.value_bytes()) {
                        mtime_sec = sec;
                        mtime_nsec = nsec;
                    }
                }
                Ok("atime") => atime = parse_pax_time(ext.value_bytes()),
                _ => {}
            }
        }
    }
    Ok(EntryMeta {
        name,
        entry_type,
        size,
        mode,
        mtime_sec,
        mtime_nsec,
        atime,
        link_target,
    })
}

/// Parses a PAX time value, `seconds[.fraction]`, into seconds and a
/// signed nanosecond offset. The sign character is inspected directly so
/// values like `-0.5` keep their fraction pointing into the past.
fn parse_pax_time(value: &[u8]) -> Option<(i64, i32)> {
    let value = std::str::from_utf8(value).ok()?;
    let negative = value.starts_with('-');
    let (sec, frac) = match value.split_once('.') {
        Some((sec, frac)) => (sec, frac),
        None => (value, ""),
    };
    let sec: i64 = sec.parse().ok()?;
    if frac.is_empty() {
        return Some((sec, 0));
    }
    let digits: String = frac.chars().take(9).collect();
    if digits.chars().any(|c| !c.is_ascii_digit()) {
        return None;
    }
    let nsec: i32 = format!("{:0<9}", digits).parse().ok()?;
    Some((sec, if negative { -nsec } else { nsec }))
}

impl EntryMeta {
    fn context_path(&self) -> PathBuf {
        PathBuf::from(std::ffi::OsStr::from_bytes(&self.name))
    }

    fn file_times(&self) -> FileTimes {
        let modified = system_time(self.mtime_sec, self.mtime_nsec);
        let accessed = self
            .atime
            .map(|(sec, nsec)| system_time(sec, nsec))
            .unwrap_or(modified);
        FileTimes::new().set_accessed(accessed).set_modified(modified)
    }
}

fn system_time(sec: i64, nsec: i32) -> SystemTime {
    let base = if sec >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(sec as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(sec.unsigned_abs())
    };
    if nsec >= 0 {
        base + Duration::new(0, nsec as u32)
    } else {
        base - Duration::new(0, nsec.unsigned_abs())
    }
}
