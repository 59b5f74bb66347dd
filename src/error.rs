use std::io;
use std::path::PathBuf;

/// The primary error type for all operations in the `partar` crate.
#[derive(Debug)]
pub enum ArchiveError {
    /// An I/O error occurred, typically while reading or writing a file.
    /// Includes the path where the error happened, if one is known.
    Io { source: io::Error, path: PathBuf },

    /// An archive-relative path failed validation: empty, absolute,
    /// containing a `..` segment, a backslash, or a NUL byte.
    ForbiddenPath { path: PathBuf },

    /// A tar type flag (or a filesystem object kind) this engine does not
    /// handle.
    UnsupportedFileType { flag: u8 },

    /// A compression algorithm name that is not recognized.
    UnsupportedAlgorithm(String),

    /// A bad option value, such as a zero worker count or an unknown
    /// compression level.
    InvalidArgument(String),

    /// An option applied to a role it does not support, e.g. a compression
    /// level on extraction.
    InapplicableOption { option: &'static str, role: &'static str },
}

impl ArchiveError {
    /// Attaches path context to an I/O error.
    pub(crate) fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        ArchiveError::Io { source, path: path.into() }
    }

    pub(crate) fn forbidden(path: impl Into<PathBuf>) -> Self {
        ArchiveError::ForbiddenPath { path: path.into() }
    }
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io { source, path } if path.as_os_str().is_empty() => {
                write!(f, "I/O error: {}", source)
            }
            ArchiveError::Io { source, path } => {
                write!(f, "I/O error on path '{}': {}", path.display(), source)
            }
            ArchiveError::ForbiddenPath { path } => {
                write!(f, "forbidden path '{}'", path.display())
            }
            ArchiveError::UnsupportedFileType { flag } => {
                write!(f, "unsupported file type '{}'", char::from(*flag))
            }
            ArchiveError::UnsupportedAlgorithm(name) => {
                write!(f, "unsupported compression algorithm '{}'", name)
            }
            ArchiveError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ArchiveError::InapplicableOption { option, role } => {
                write!(f, "option {} is not applicable to {}", option, role)
            }
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// Generic I/O conversion for errors that carry no useful path.
impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        ArchiveError::Io { source: err, path: PathBuf::new() }
    }
}
