//! Configuration surface shared by the composer and the resolver.
//!
//! Every knob is an [`ArchiveOption`] value tagged with the roles it applies
//! to. A `Composer` or `resolve` call checks each option against its own
//! role at construction time, so handing a worker count to the creation side
//! fails early with [`ArchiveError::InapplicableOption`] instead of being
//! silently ignored.

use std::fmt;
use std::str::FromStr;

use crate::error::ArchiveError;

/// The streaming compression algorithm layered over the tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// Plain tar, no compression.
    #[default]
    None,
    /// RFC 1952 gzip.
    Gzip,
    /// LZ4 frame format.
    Lz4,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Algorithm::None => "none",
            Algorithm::Gzip => "gzip",
            Algorithm::Lz4 => "lz4",
        })
    }
}

impl FromStr for Algorithm {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Algorithm::None),
            "gzip" => Ok(Algorithm::Gzip),
            "lz4" => Ok(Algorithm::Lz4),
            other => Err(ArchiveError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Abstract compression level, mapped to codec-specific levels in the codec
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Fastest,
    Fast,
    #[default]
    Default,
    Good,
    Best,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Fastest => "fastest",
            Level::Fast => "fast",
            Level::Default => "default",
            Level::Good => "good",
            Level::Best => "best",
        })
    }
}

impl FromStr for Level {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fastest" => Ok(Level::Fastest),
            "fast" => Ok(Level::Fast),
            "" | "default" => Ok(Level::Default),
            "good" => Ok(Level::Good),
            "best" => Ok(Level::Best),
            other => Err(ArchiveError::InvalidArgument(format!(
                "unknown compression level '{}'",
                other
            ))),
        }
    }
}

/// The role an option is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Composer,
    Resolver,
}

impl Role {
    fn name(self) -> &'static str {
        match self {
            Role::Composer => "creation",
            Role::Resolver => "extraction",
        }
    }
}

/// A single configuration knob for archive creation or extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOption {
    /// Compression algorithm. Applies to both roles.
    Compression(Algorithm),
    /// Compression level. Creation only.
    CompressionLevel(Level),
    /// Number of writer workers. Extraction only; must be at least 1.
    Thread(usize),
    /// Capacity of the bounded queue between producer and consumer; also the
    /// number of file bodies that may be in flight. Applies to both roles.
    ReadAhead(usize),
    /// Size in bytes at or below which an extracted file body is buffered
    /// and handed to a worker. Extraction only.
    Threshold(u64),
}

impl ArchiveOption {
    fn name(&self) -> &'static str {
        match self {
            ArchiveOption::Compression(_) => "compression",
            ArchiveOption::CompressionLevel(_) => "compression level",
            ArchiveOption::Thread(_) => "thread",
            ArchiveOption::Threshold(_) => "threshold",
            ArchiveOption::ReadAhead(_) => "read ahead",
        }
    }

    fn roles(&self) -> &'static [Role] {
        match self {
            ArchiveOption::Compression(_) | ArchiveOption::ReadAhead(_) => {
                &[Role::Composer, Role::Resolver]
            }
            ArchiveOption::CompressionLevel(_) => &[Role::Composer],
            ArchiveOption::Thread(_) | ArchiveOption::Threshold(_) => &[Role::Resolver],
        }
    }

    /// Validates both the applicability and the value of this option.
    pub(crate) fn check(&self, role: Role) -> Result<(), ArchiveError> {
        if !self.roles().contains(&role) {
            return Err(ArchiveError::InapplicableOption {
                option: self.name(),
                role: role.name(),
            });
        }
        if let ArchiveOption::Thread(0) = self {
            return Err(ArchiveError::InvalidArgument(
                "thread must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
