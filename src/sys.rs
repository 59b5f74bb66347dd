//! Per-OS filesystem advisories.
//!
//! All helpers here are best-effort: the callers ignore their results, since
//! a missing advisory only costs performance and symlink modes are not a
//! thing on every platform.

use std::io;
use std::os::fd::AsFd;
use std::path::Path;

/// Hints the kernel that `len` bytes of the file will be read sequentially
/// in the near future.
#[cfg(target_os = "linux")]
pub fn read_ahead<Fd: AsFd>(fd: Fd, len: u64) -> io::Result<()> {
    use rustix::fs::{fadvise, Advice};
    fadvise(fd, 0, len, Advice::Sequential)?;
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn read_ahead<Fd: AsFd>(fd: Fd, len: u64) -> io::Result<()> {
    rustix::fs::fcntl_rdadvise(fd, 0, len)?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn read_ahead<Fd: AsFd>(_fd: Fd, _len: u64) -> io::Result<()> {
    Ok(())
}

/// Changes the permission bits of a symlink itself. Linux has no notion of
/// symlink modes, so this is a no-op there.
#[cfg(target_os = "macos")]
pub fn chmod_symlink(path: &Path, mode: u32) -> io::Result<()> {
    use rustix::fs::{chmodat, AtFlags, Mode, CWD};
    chmodat(
        CWD,
        path,
        Mode::from_bits_truncate(mode),
        AtFlags::SYMLINK_NOFOLLOW,
    )?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn chmod_symlink(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
