//! Filesystem metadata snapshots.
//!
//! [`stat`] and [`stat_at`] translate an `lstat`/`fstatat` result into an
//! [`Entry`], reading the link target for symlinks and resolving owner and
//! group names through a process-wide cache. The `*_at` form works relative
//! to an already opened directory so the kernel never re-walks the full path.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use rustix::fs::{AtFlags, FileType, Stat};
use rustix::io::Errno;

use crate::error::ArchiveError;

/// A snapshot of one filesystem object at the moment of traversal.
///
/// Entries are immutable once built; the walker hands them to the composer
/// by value.
#[derive(Debug, Clone)]
pub struct Entry {
    name: OsString,
    size: u64,
    mode: u32,
    mtime_sec: i64,
    mtime_nsec: u32,
    link_target: Option<PathBuf>,
    uid: u32,
    gid: u32,
    uname: String,
    gname: String,
}

impl Entry {
    /// The base name of the object.
    pub fn name(&self) -> &OsStr {
        &self.name
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The raw `st_mode`: file-type bits plus permission and
    /// setuid/setgid/sticky bits.
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// The permission portion of the mode, including the special bits.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Modification time, seconds since the epoch.
    pub fn mtime_sec(&self) -> i64 {
        self.mtime_sec
    }

    /// Sub-second part of the modification time.
    pub fn mtime_nsec(&self) -> u32 {
        self.mtime_nsec
    }

    /// The symlink target, if this entry is a symlink.
    pub fn link_target(&self) -> Option<&Path> {
        self.link_target.as_deref()
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Resolved owner name; empty if the lookup failed.
    pub fn uname(&self) -> &str {
        &self.uname
    }

    /// Resolved group name; empty if the lookup failed.
    pub fn gname(&self) -> &str {
        &self.gname
    }

    pub(crate) fn file_type(&self) -> FileType {
        FileType::from_raw_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::RegularFile
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    pub(crate) fn from_stat(name: &OsStr, st: &Stat) -> Entry {
        let uid = st.st_uid;
        let gid = st.st_gid;
        Entry {
            name: name.to_owned(),
            size: st.st_size as u64,
            mode: st.st_mode as u32,
            mtime_sec: st.st_mtime as i64,
            mtime_nsec: st.st_mtime_nsec as u32,
            link_target: None,
            uid,
            gid,
            uname: lookup_user(uid),
            gname: lookup_group(gid),
        }
    }
}

/// Stats a path and returns an [`Entry`]. A final symlink is not followed.
pub fn stat(path: &Path) -> Result<Entry, ArchiveError> {
    let st = rustix::fs::lstat(path).map_err(|e| ArchiveError::io(e.into(), path))?;
    let name = path.file_name().unwrap_or(path.as_os_str());
    let mut entry = Entry::from_stat(name, &st);
    if entry.is_symlink() {
        entry.link_target = Some(read_link(path)?);
    }
    Ok(entry)
}

/// Stats a name inside an already opened directory and returns an [`Entry`].
pub fn stat_at<Fd: AsFd>(dir_fd: Fd, name: &OsStr) -> Result<Entry, ArchiveError> {
    let st = rustix::fs::statat(&dir_fd, name, AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|e| ArchiveError::io(e.into(), name))?;
    let mut entry = Entry::from_stat(name, &st);
    if entry.is_symlink() {
        entry.link_target = Some(read_link_at(&dir_fd, name)?);
    }
    Ok(entry)
}

// The buffer starts at 256 bytes and doubles until the whole target fits.
const READLINK_BUF_SIZE: usize = 256;

fn read_link(path: &Path) -> Result<PathBuf, ArchiveError> {
    loop {
        match rustix::fs::readlink(path, Vec::with_capacity(READLINK_BUF_SIZE)) {
            Ok(target) => return Ok(PathBuf::from(OsString::from_vec(target.into_bytes()))),
            Err(Errno::INTR) => continue,
            Err(e) => return Err(ArchiveError::io(e.into(), path)),
        }
    }
}

fn read_link_at<Fd: AsFd>(dir_fd: Fd, name: &OsStr) -> Result<PathBuf, ArchiveError> {
    loop {
        match rustix::fs::readlinkat(&dir_fd, name, Vec::with_capacity(READLINK_BUF_SIZE)) {
            Ok(target) => return Ok(PathBuf::from(OsString::from_vec(target.into_bytes()))),
            Err(Errno::INTR) => continue,
            Err(e) => return Err(ArchiveError::io(e.into(), name)),
        }
    }
}

// Process-wide id-to-name caches. Failed lookups are cached as empty strings
// so a missing passwd entry costs one system lookup, not one per file.
static USERS: OnceLock<Mutex<HashMap<u32, String>>> = OnceLock::new();
static GROUPS: OnceLock<Mutex<HashMap<u32, String>>> = OnceLock::new();

fn lookup_user(uid: u32) -> String {
    let mut cache = USERS.get_or_init(Default::default).lock().unwrap();
    if let Some(name) = cache.get(&uid) {
        return name.clone();
    }
    let name = uzers::get_user_by_uid(uid)
        .map(|u| u.name().to_string_lossy().into_owned())
        .unwrap_or_default();
    cache.insert(uid, name.clone());
    name
}

fn lookup_group(gid: u32) -> String {
    let mut cache = GROUPS.get_or_init(Default::default).lock().unwrap();
    if let Some(name) = cache.get(&gid) {
        return name.clone();
    }
    let name = uzers::get_group_by_gid(gid)
        .map(|g| g.name().to_string_lossy().into_owned())
        .unwrap_or_default();
    cache.insert(gid, name.clone());
    name
}
