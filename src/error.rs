//! # Error Kinds
//!
//! Every fallible operation in the crate returns `eyre::Result` with rich
//! context, following the same convention as the storage layer. Failures
//! that callers are expected to branch on carry a typed [`BarecatError`]
//! kind at the root of the report chain; recover it with
//! `err.downcast_ref::<BarecatError>()`.
//!
//! Plain I/O and SQLite failures that have no actionable kind (disk full,
//! corrupted database file mid-read) stay as wrapped source errors.

use thiserror::Error;

/// Typed failure kinds surfaced by archive operations.
#[derive(Debug, Error)]
pub enum BarecatError {
    #[error("not found: '{0}'")]
    NotFound(String),

    #[error("already exists: '{0}'")]
    AlreadyExists(String),

    #[error("is a directory: '{0}'")]
    IsADirectory(String),

    #[error("not a directory: '{0}'")]
    NotADirectory(String),

    #[error("directory not empty: '{0}'")]
    DirectoryNotEmpty(String),

    /// The blob can never fit in any shard under the configured cap.
    #[error("blob of {size} bytes cannot fit under the shard size limit of {limit} bytes")]
    BlobTooLarge { size: u64, limit: u64 },

    /// Precondition violation: an append was requested that would overrun
    /// the cap of the target shard. The allocator must roll over first.
    #[error("appending {size} bytes at offset {offset} would exceed the shard size limit of {limit} bytes")]
    ShardCapExceeded { offset: u64, size: u64, limit: u64 },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid glob pattern: {0}")]
    InvalidPattern(String),

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("I/O error on shard {shard}")]
    ShardIo {
        shard: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("crc32c mismatch for '{path}': stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("another writer holds the archive lock")]
    ConcurrentWriter,

    #[error("archive is open read-only")]
    ReadOnlyArchive,

    #[error("operation not permitted in append-only mode")]
    AppendOnlyArchive,
}
