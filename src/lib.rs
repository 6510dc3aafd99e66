//! # Barecat - Aggregate Storage for Many Small Files
//!
//! Barecat packs very large collections of small immutable blobs (tens of
//! millions of entries, terabytes of data) into a handful of files while
//! keeping O(1) random access by hierarchical path. This implementation
//! prioritizes:
//!
//! - **Constant-memory open**: the index is queried, never loaded
//! - **Zero-copy reads**: memory-mapped shards hand out `&[u8]` borrows
//! - **Huge flat directories**: listing is an indexed range scan, not a
//!   readdir
//! - **Dumb readers**: any language that can speak SQLite and seek a file
//!   can consume an archive
//!
//! ## Quick Start
//!
//! ```ignore
//! use barecat::{Barecat, OpenMode};
//!
//! let mut archive = Barecat::builder("./dataset")
//!     .mode(OpenMode::CreateNew)
//!     .shard_size_limit(32 * 1024 * 1024 * 1024)
//!     .open()?;
//!
//! archive.write("train/00001/img.jpg", &jpeg_bytes)?;
//! let bytes = archive.read("train/00001/img.jpg")?;
//! archive.close()?;
//! ```
//!
//! ## File Layout
//!
//! An archive is a base path plus a fixed set of siblings:
//!
//! ```text
//! dataset-sqlite-index    # relational index: paths, addresses, aggregates
//! dataset-shard-00000     # blob bytes, pure concatenation, no framing
//! dataset-shard-00001     # next shard once the size limit is reached
//! ...
//! ```
//!
//! Shards carry no header or footer; every byte of a shard either belongs
//! to exactly one blob or is an unreferenced gap awaiting defragmentation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │         Session (Barecat)                │
//! │  open modes · writer lock · mutator      │
//! ├─────────────────────┬────────────────────┤
//! │   Index (SQLite)    │   Shard store      │
//! │  paths, addresses,  │  append, read_at,  │
//! │  dir aggregates,    │  truncate, rollover│
//! │  triggers           │                    │
//! ├─────────────────────┴────────────────────┤
//! │   Mapped shards (zero-copy read path)    │
//! ├──────────────────────────────────────────┤
//! │   Defragmenter (full pack / first fit)   │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Per-directory statistics (direct child counts, recursive file count
//! and byte total) are maintained transactively by SQL triggers on every
//! mutation, so `stat("some/dir")` answers subtree questions in O(1).
//!
//! ## Concurrency
//!
//! Single writer, any number of readers. The writer holds an advisory
//! lock on the index file for its whole session; readers open the index
//! read-only and optionally map the shards privately. Blob borrows from
//! the mapped read path are pinned to the session lifetime by the borrow
//! checker.
//!
//! ## Module Overview
//!
//! - [`barecat`]: the session type and its builder
//! - [`index`]: relational metadata store and aggregate triggers
//! - [`sharder`]: numbered shard files and the append/rollover discipline
//! - [`mapped`]: memory-mapped zero-copy read path
//! - [`defrag`]: gap discovery and the two compaction strategies
//! - [`paths`]: normalization, parents, glob translation
//! - [`error`]: typed error kinds carried inside `eyre` reports

pub mod barecat;
pub mod defrag;
pub mod error;
pub mod index;
pub mod info;
pub mod mapped;
pub mod paths;
pub mod sharder;

pub use barecat::{
    index_path, Barecat, BarecatBuilder, BlobStream, DefragMode, OpenMode, RenameMode, VerifyIssue,
};
pub use defrag::Gap;
pub use error::BarecatError;
pub use index::{Index, Walk};
pub use info::{DirInfo, EntryInfo, FileInfo, Metadata, Order};
pub use sharder::{crc32c, Sharder};
