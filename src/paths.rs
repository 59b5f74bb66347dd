//! Archive-relative path policy.
//!
//! Both directions go through [`validate_rel_path`]: names placed into tar
//! headers on creation and names read out of headers on extraction. The
//! check is purely lexical and never touches the filesystem.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::ArchiveError;

/// Validates an archive-relative path. The path must be non-empty, relative,
/// free of backslashes and NUL bytes, and must not contain a `..` segment.
pub fn validate_rel_path(path: &[u8]) -> Result<(), ArchiveError> {
    if path.is_empty() {
        return Err(ArchiveError::forbidden(""));
    }
    let reject = || Err(ArchiveError::forbidden(Path::new(OsStr::from_bytes(path))));
    if path[0] == b'/' {
        return reject();
    }
    if path.contains(&b'\\') || path.contains(&0) {
        return reject();
    }
    if path == b".."
        || path.starts_with(b"../")
        || path.ends_with(b"/..")
        || path.windows(4).any(|w| w == b"/../")
    {
        return reject();
    }
    Ok(())
}

/// Strips leading slashes so absolute header names become relative ones.
pub(crate) fn trim_leading_slashes(path: &[u8]) -> &[u8] {
    let start = path.iter().position(|&b| b != b'/').unwrap_or(path.len());
    &path[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_paths() {
        for bad in [
            &b""[..],
            b"/x",
            b"/etc",
            b"a/../b",
            b"..",
            b"../x",
            b"x/..",
            b"a\\b",
            b"a\0b",
        ] {
            assert!(validate_rel_path(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn accepts_good_paths() {
        for good in [&b"test"[..], b"test/aaa", b"./test/././aaa", b"..a", b"a..b", b"a../b"] {
            assert!(validate_rel_path(good).is_ok(), "{:?} should be accepted", good);
        }
    }

    #[test]
    fn trims_slashes() {
        assert_eq!(trim_leading_slashes(b"/etc/passwd"), b"etc/passwd");
        assert_eq!(trim_leading_slashes(b"//x"), b"x");
        assert_eq!(trim_leading_slashes(b"x"), b"x");
        assert_eq!(trim_leading_slashes(b"///"), b"");
    }
}
