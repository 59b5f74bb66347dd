//! # partar
//!
//! A parallel tar archiver tuned for trees of small-to-medium files on
//! POSIX filesystems.
//!
//! Creation pipelines file bodies from an inode-ordered, descriptor-cached
//! tree walker into a dedicated tar-writer routine over a bounded queue.
//! Extraction pipelines tar entries from a single reader into a pool of
//! writer workers, falling back to inline writes above a size threshold.
//! Either direction can layer a gzip or LZ4 stream over the raw bytes.
//!
//! ## Key Modules
//!
//! - [`compose`]: archive creation ([`Composer`]).
//! - [`mod@resolve`]: archive extraction ([`resolve()`]).
//! - [`walk`]: the inode-ordered tree walker.
//! - [`stat`]: filesystem metadata snapshots ([`Entry`]).
//! - [`codec`]: gzip/LZ4 stream wrapping.
//! - [`options`]: the role-checked option set.
//!
//! ## Example
//!
//! ```no_run
//! use partar::{ArchiveOption, Algorithm, Composer};
//!
//! # fn main() -> Result<(), partar::ArchiveError> {
//! let sink = std::fs::File::create("tree.tar.gz")?;
//! let mut composer = Composer::new(sink, &[ArchiveOption::Compression(Algorithm::Gzip)])?;
//! composer.add("some/tree", "")?;
//! composer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod compose;
pub mod error;
pub mod options;
pub mod paths;
pub mod pool;
pub mod resolve;
pub mod stat;
pub mod sys;
pub mod walk;

pub use compose::Composer;
pub use error::ArchiveError;
pub use options::{Algorithm, ArchiveOption, Level};
pub use resolve::resolve;
pub use stat::{stat, stat_at, Entry};
pub use walk::walk;
