//! Inode-ordered, descriptor-cached tree traversal.
//!
//! The walker keeps the parent directory open and issues every syscall
//! relative to its descriptor (`openat`, `fstatat`, `readlinkat`, batched
//! `getdents`), so the kernel never re-walks and re-checks the path for each
//! child. Entries are sorted by ascending inode before they are visited:
//! on ext4 and XFS with a cold page cache, reading leaf data in inode order
//! approximates the on-disk layout and is dramatically faster than reading
//! in directory order.
//!
//! Regular files are opened while the walker is still inside the directory
//! and a sequential read-ahead advisory is issued for the first 256 KiB, so
//! the kernel prefetches file bodies while the consumer is busy with earlier
//! entries.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::fs::{FileType, Mode, OFlags};

use crate::error::ArchiveError;
use crate::pool::BufferPool;
use crate::stat::{stat_at, Entry};
use crate::sys;

// Directory entries are fetched in large batches; the default readdir
// buffer of a few KiB causes far too many getdents round trips on big
// directories.
const DENT_BUF_SIZE: usize = 8 << 20; // 8 MiB
const ADVICE_SIZE: u64 = 256 << 10; // 256 KiB

/// One raw record out of a getdents batch. The type tag is a hint only;
/// `stat_at` is authoritative.
struct Dirent {
    ino: u64,
    name: OsString,
    kind: FileType,
}

/// Walks the tree rooted at `path` depth-first, invoking `visit` exactly
/// once for the root and every descendant.
///
/// `path` must name a directory. For regular files the visitor receives an
/// opened reader which it takes ownership of. An error returned by the
/// visitor aborts the walk and is returned as-is; the walker never reports
/// its own failures through the visitor.
pub fn walk<F>(path: &Path, mut visit: F) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, Entry, Option<File>) -> Result<(), ArchiveError>,
{
    let pool = BufferPool::new(DENT_BUF_SIZE);
    let path = std::path::absolute(path).map_err(|e| ArchiveError::io(e, path))?;
    let dir_fd = rustix::fs::open(
        &path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| ArchiveError::io(e.into(), &path))?;
    // The root itself is visited manually; the recursion only sees children.
    let st = rustix::fs::fstat(&dir_fd).map_err(|e| ArchiveError::io(e.into(), &path))?;
    let name = path.file_name().unwrap_or(path.as_os_str());
    visit(&path, Entry::from_stat(name, &st), None)?;
    walk_dir(&path, dir_fd, &pool, &mut visit)
}

/// One recursion frame: iterates an opened directory. The directory fd is
/// owned by this frame and closed on exit, success or error alike; the dent
/// buffer goes back to the pool the same way.
fn walk_dir<F>(
    dir_path: &Path,
    dir_fd: OwnedFd,
    pool: &BufferPool,
    visit: &mut F,
) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, Entry, Option<File>) -> Result<(), ArchiveError>,
{
    let mut buf = pool.get();
    let result = walk_entries(dir_path, &dir_fd, &mut buf, pool, visit);
    pool.put(buf);
    result
}

fn walk_entries<F>(
    dir_path: &Path,
    dir_fd: &OwnedFd,
    buf: &mut Vec<u8>,
    pool: &BufferPool,
    visit: &mut F,
) -> Result<(), ArchiveError>
where
    F: FnMut(&Path, Entry, Option<File>) -> Result<(), ArchiveError>,
{
    let dirents = read_dirents(dir_path, dir_fd, buf)?;
    for dent in dirents {
        let mut reader = None;
        if dent.kind == FileType::RegularFile {
            reader = Some(open_file_at(dir_fd, dir_path, &dent.name)?);
        }
        let entry = stat_at(dir_fd, &dent.name)
            .map_err(|e| at_path(e, dir_path.join(&dent.name)))?;
        if reader.is_none() && entry.is_file() {
            // The d_type hint missed (some filesystems report DT_UNKNOWN);
            // the stat says regular, so a body reader is still owed.
            reader = Some(open_file_at(dir_fd, dir_path, &dent.name)?);
        }
        let file_path = dir_path.join(&dent.name);
        let is_dir = entry.is_dir();
        visit(&file_path, entry, reader)?;
        if is_dir {
            let sub_fd = rustix::fs::openat(
                dir_fd,
                dent.name.as_os_str(),
                OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
                Mode::empty(),
            )
            .map_err(|e| ArchiveError::io(e.into(), &file_path))?;
            walk_dir(&file_path, sub_fd, pool, visit)?;
        }
    }
    Ok(())
}

fn open_file_at(dir_fd: &OwnedFd, dir_path: &Path, name: &OsStr) -> Result<File, ArchiveError> {
    let fd = rustix::fs::openat(
        dir_fd,
        name,
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| ArchiveError::io(e.into(), dir_path.join(name)))?;
    // Ask the kernel to prefetch the head of the file; ignored on failure.
    let _ = sys::read_ahead(&fd, ADVICE_SIZE);
    Ok(File::from(fd))
}

/// Drains the directory through batched getdents calls and returns its
/// entries sorted by ascending inode, `.` and `..` removed.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_dirents(
    dir_path: &Path,
    dir_fd: &OwnedFd,
    buf: &mut Vec<u8>,
) -> Result<Vec<Dirent>, ArchiveError> {
    use rustix::fs::RawDir;
    use rustix::io::Errno;

    let mut dirents = Vec::new();
    let mut iter = RawDir::new(dir_fd, buf.spare_capacity_mut());
    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(Errno::INTR) => continue,
            Err(e) => return Err(ArchiveError::io(e.into(), dir_path)),
        };
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        dirents.push(Dirent {
            ino: entry.ino(),
            name: OsStr::from_bytes(name).to_owned(),
            kind: entry.file_type(),
        });
    }
    dirents.sort_unstable_by_key(|d| d.ino);
    Ok(dirents)
}

/// Fallback for Unixes without a raw getdents interface; `Dir` buffers
/// internally, so the pooled buffer goes unused here.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_dirents(
    dir_path: &Path,
    dir_fd: &OwnedFd,
    _buf: &mut Vec<u8>,
) -> Result<Vec<Dirent>, ArchiveError> {
    let mut dirents = Vec::new();
    let dir = rustix::fs::Dir::read_from(dir_fd)
        .map_err(|e| ArchiveError::io(e.into(), dir_path))?;
    for entry in dir {
        let entry = entry.map_err(|e| ArchiveError::io(e.into(), dir_path))?;
        let name = entry.file_name().to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        dirents.push(Dirent {
            ino: entry.ino(),
            name: OsStr::from_bytes(name).to_owned(),
            kind: entry.file_type(),
        });
    }
    dirents.sort_unstable_by_key(|d| d.ino);
    Ok(dirents)
}

fn at_path(err: ArchiveError, path: std::path::PathBuf) -> ArchiveError {
    match err {
        ArchiveError::Io { source, .. } => ArchiveError::Io { source, path },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn visits_every_entry_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), b"aa").unwrap();
        fs::write(dir.path().join("sub/b"), b"bb").unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("ln")).unwrap();

        let mut seen = Vec::new();
        walk(dir.path(), |path, entry, reader| {
            if entry.is_file() {
                let mut body = String::new();
                reader.unwrap().read_to_string(&mut body).unwrap();
                assert_eq!(body.len() as u64, entry.size());
            } else {
                assert!(reader.is_none());
            }
            seen.push(path.to_path_buf());
            Ok(())
        })
        .unwrap();

        let root = std::path::absolute(dir.path()).unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0], root);
        for name in ["a", "sub", "ln", "sub/b"] {
            assert!(seen.contains(&root.join(name)), "missing {name}");
        }
    }

    #[test]
    fn visits_in_inode_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zz", "a", "m", "q", "b"] {
            fs::write(dir.path().join(name), name).unwrap();
        }

        let mut inos = Vec::new();
        walk(dir.path(), |path, entry, _reader| {
            if entry.is_file() {
                inos.push(fs::metadata(path).unwrap().ino());
            }
            Ok(())
        })
        .unwrap();

        let mut sorted = inos.clone();
        sorted.sort_unstable();
        assert_eq!(inos, sorted);
    }

    #[test]
    fn visitor_error_aborts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"aa").unwrap();
        fs::write(dir.path().join("b"), b"bb").unwrap();

        let mut calls = 0;
        let err = walk(dir.path(), |_path, _entry, _reader| {
            calls += 1;
            Err(ArchiveError::InvalidArgument("stop".into()))
        })
        .unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArgument(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn root_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(walk(file.path(), |_, _, _| Ok(())).is_err());
    }
}
