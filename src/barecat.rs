//! # Archive Session
//!
//! [`Barecat`] is the single entry point tying the two halves of an
//! archive together: the SQLite index (`<base>-sqlite-index`) and the
//! numbered shard files (`<base>-shard-NNNNN`). A session owns one index
//! connection, one handle per shard and, for read-only sessions that ask
//! for it, one memory map per shard.
//!
//! ## Open modes
//!
//! | Mode       | Index            | Shards     | Notes                        |
//! |------------|------------------|------------|------------------------------|
//! | ReadOnly   | must exist, ro   | ro / mmap  | any number of sessions       |
//! | ReadWrite  | open or create   | rw         | exclusive writer lock        |
//! | CreateNew  | must not exist   | rw         | exclusive writer lock        |
//! | Append     | open or create   | rw         | add-only; no delete/rename   |
//! | Overwrite  | replace existing | rw         | destroys previous archive    |
//!
//! Writer exclusivity is an advisory `flock` on the index file held for
//! the session lifetime; a second writer fails fast with
//! *concurrent-writer*. Readers take no lock. SQLite's own locking uses
//! fcntl ranges, which `flock` does not interact with.
//!
//! ## Write discipline
//!
//! A write appends the blob bytes first, then records the file row and
//! any missing ancestor directories in one index transaction. If the
//! recording fails (typically *already-exists*), the appended bytes are
//! cut back off the shard, so the common failure leaves no orphan. A
//! crash between append and commit leaves an orphan region: it is
//! harmless, reported at open, and reclaimed by defragmentation.
//!
//! ## Zero-copy reads
//!
//! [`Barecat::read_mapped`] returns `&[u8]` borrowed from the session's
//! shard maps. The borrow checker pins these slices to the session's
//! lifetime; there is no way to hold one across `close()`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use tracing::{debug, warn};

use crate::defrag::Defragger;
use crate::error::BarecatError;
use crate::index::{Index, Walk};
use crate::info::{DirInfo, EntryInfo, FileInfo, Metadata, Order};
use crate::mapped::MappedShards;
use crate::paths;
use crate::sharder::{self, Sharder, CRC32C};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadOnly,
    ReadWrite,
    CreateNew,
    Append,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragMode {
    Full,
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenameMode {
    #[default]
    NoReplace,
    Replace,
    Exchange,
}

/// A problem found by [`Barecat::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },
    /// The blob's region reaches past the physical end of its shard.
    RegionOutOfBounds { path: String },
    /// A directory's stored aggregates diverge from a ground-truth recount.
    AggregateMismatch { path: String },
}

impl std::fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyIssue::ChecksumMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "crc32c mismatch for '{path}': stored {expected:#010x}, computed {actual:#010x}"
            ),
            VerifyIssue::RegionOutOfBounds { path } => {
                write!(f, "region of '{path}' reaches past the end of its shard")
            }
            VerifyIssue::AggregateMismatch { path } => {
                write!(f, "directory '{path}' has stale aggregates")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Dir,
}

// Reserved intermediate name for the exchange rotation; normalization can
// never produce a path containing a control character.
const EXCHANGE_TMP: &str = "\u{1}exchange-in-progress";

/// Index file path for an archive base path.
pub fn index_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push("-sqlite-index");
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct BarecatBuilder {
    base: PathBuf,
    mode: OpenMode,
    shard_size_limit: Option<u64>,
    mmap: bool,
}

impl BarecatBuilder {
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Rollover threshold for writers. Shrinking an existing archive's
    /// limit below its largest shard is rejected at open.
    pub fn shard_size_limit(mut self, limit: u64) -> Self {
        self.shard_size_limit = Some(limit);
        self
    }

    /// Maps every shard at open so reads can borrow bytes instead of
    /// copying. Read-only sessions only.
    pub fn mmap(mut self, mmap: bool) -> Self {
        self.mmap = mmap;
        self
    }

    pub fn open(self) -> Result<Barecat> {
        let base = self.base;
        let ipath = index_path(&base);

        if matches!(self.mode, OpenMode::ReadOnly) {
            if self.shard_size_limit.is_some() {
                bail!("the shard size limit can only be set by a writer session");
            }
            if !ipath.exists() {
                return Err(BarecatError::NotFound(ipath.display().to_string()).into());
            }
            let index = Index::open(&ipath, true)?;
            let limit = index.shard_size_limit()?;
            let sharder = Sharder::open(&base, true, limit)?;
            let mapped = if self.mmap {
                Some(MappedShards::map_all(&sharder)?)
            } else {
                None
            };
            return Ok(Barecat {
                base,
                index,
                sharder,
                mapped,
                readonly: true,
                append_only: false,
                lock: None,
            });
        }

        if self.mmap {
            bail!("memory mapping is only available for read-only sessions");
        }

        let already_exists = ipath.exists() || Sharder::any_exists(&base);
        match self.mode {
            OpenMode::CreateNew if already_exists => {
                return Err(BarecatError::AlreadyExists(base.display().to_string()).into());
            }
            OpenMode::Overwrite if already_exists => {
                warn!(base = %base.display(), "overwriting existing archive");
                if ipath.exists() {
                    fs::remove_file(&ipath).wrap_err_with(|| {
                        format!("failed to remove index '{}'", ipath.display())
                    })?;
                }
                Sharder::remove_all(&base)?;
            }
            _ => {}
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&ipath)
            .wrap_err_with(|| format!("failed to open index '{}'", ipath.display()))?;
        lock_exclusive(&lock)?;

        let is_new = lock
            .metadata()
            .wrap_err("failed to stat index file")?
            .len()
            == 0;
        let index = if is_new {
            Index::create(&ipath)?
        } else {
            Index::open(&ipath, false)?
        };
        if let Some(limit) = self.shard_size_limit {
            index.set_shard_size_limit(limit)?;
        }
        let limit = index.shard_size_limit()?;
        let sharder = Sharder::open(&base, false, limit)?;

        let archive = Barecat {
            base,
            index,
            sharder,
            mapped: None,
            readonly: false,
            append_only: matches!(self.mode, OpenMode::Append),
            lock: Some(lock),
        };
        archive.check_shard_presence()?;
        archive.report_orphans()?;
        Ok(archive)
    }
}

#[derive(Debug)]
pub struct Barecat {
    base: PathBuf,
    index: Index,
    sharder: Sharder,
    mapped: Option<MappedShards>,
    readonly: bool,
    append_only: bool,
    /// Advisory writer lock on the index file, held until close.
    lock: Option<File>,
}

impl Barecat {
    /// Opens an archive read-only, without memory mapping.
    pub fn open(base: impl AsRef<Path>) -> Result<Self> {
        Self::builder(base).open()
    }

    pub fn builder(base: impl AsRef<Path>) -> BarecatBuilder {
        BarecatBuilder {
            base: base.as_ref().to_path_buf(),
            mode: OpenMode::ReadOnly,
            shard_size_limit: None,
            mmap: false,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    fn check_shard_presence(&self) -> Result<()> {
        let used = self.index.num_used_shards()?;
        if used > self.sharder.num_shards() {
            return Err(BarecatError::CorruptIndex(format!(
                "index references {used} shards but only {} shard files exist",
                self.sharder.num_shards()
            ))
            .into());
        }
        Ok(())
    }

    fn report_orphans(&self) -> Result<()> {
        for shard in 0..self.sharder.num_shards() {
            let logical = self.index.logical_shard_end(shard)?;
            let physical = self.sharder.physical_end(shard)?;
            if physical > logical {
                warn!(
                    shard,
                    orphan_bytes = physical - logical,
                    "shard has unreferenced trailing bytes; defrag will reclaim them"
                );
            }
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BarecatError::ReadOnlyArchive.into());
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        self.ensure_writable()?;
        if self.append_only {
            return Err(BarecatError::AppendOnlyArchive.into());
        }
        Ok(())
    }

    fn lookup_file_checked(&self, path: &str) -> Result<FileInfo> {
        let path = paths::normalize(path)?;
        match self.index.try_lookup_file(&path)? {
            Some(fi) => Ok(fi),
            None if self.index.isdir(&path)? => Err(BarecatError::IsADirectory(path).into()),
            None => Err(BarecatError::NotFound(path).into()),
        }
    }

    fn lookup_dir_checked(&self, path: &str) -> Result<DirInfo> {
        let path = paths::normalize(path)?;
        match self.index.try_lookup_dir(&path)? {
            Some(di) => Ok(di),
            None if self.index.isfile(&path)? => Err(BarecatError::NotADirectory(path).into()),
            None => Err(BarecatError::NotFound(path).into()),
        }
    }

    // ---- reading ----------------------------------------------------------

    /// Reads a whole blob into a fresh buffer, verifying its checksum
    /// when one is stored.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let fi = self.lookup_file_checked(path)?;
        let data = self.sharder.read(fi.shard, fi.offset, fi.size)?;
        if let Some(expected) = fi.crc32c {
            let actual = sharder::crc32c(&data);
            if actual != expected {
                return Err(BarecatError::ChecksumMismatch {
                    path: fi.path,
                    expected,
                    actual,
                }
                .into());
            }
        }
        Ok(data)
    }

    /// Borrows a blob's bytes straight out of the shard mapping. Requires
    /// a session opened with [`BarecatBuilder::mmap`]; the slice lives as
    /// long as the session.
    pub fn read_mapped(&self, path: &str) -> Result<&[u8]> {
        let mapped = self
            .mapped
            .as_ref()
            .ok_or_else(|| eyre::eyre!("session was opened without memory mapping"))?;
        let fi = self.lookup_file_checked(path)?;
        mapped.blob(fi.shard, fi.offset, fi.size)
    }

    /// Reads raw bytes at a storage address, bypassing the index.
    pub fn read_from_address(&self, shard: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.sharder.read(shard, offset, size)
    }

    /// CRC32C over a storage region: zero-copy when mapped, chunked
    /// buffered reads otherwise.
    pub fn crc32c_from_address(&self, shard: u32, offset: u64, size: u64) -> Result<u32> {
        if let Some(mapped) = &self.mapped {
            return mapped.crc32c_of(shard, offset, size);
        }
        let mut digest = CRC32C.digest();
        let mut buf = [0u8; 64 * 1024];
        let mut done = 0u64;
        while done < size {
            let n = ((size - done) as usize).min(buf.len());
            self.sharder.read_at(shard, offset + done, &mut buf[..n])?;
            digest.update(&buf[..n]);
            done += n as u64;
        }
        Ok(digest.finalize())
    }

    /// Opens a seekable read-only stream over one blob.
    pub fn open_stream(&self, path: &str) -> Result<BlobStream> {
        let fi = self.lookup_file_checked(path)?;
        let file = self.sharder.clone_handle(fi.shard)?;
        Ok(BlobStream {
            file,
            start: fi.offset,
            size: fi.size,
            pos: 0,
        })
    }

    // ---- writing ----------------------------------------------------------

    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.write_with(path, data, Metadata::default())
    }

    /// Appends a blob and records it under `path`, creating missing
    /// ancestor directories. Fails with *already-exists* if the path is
    /// taken and *blob-too-large* if it can never fit in a shard.
    pub fn write_with(&mut self, path: &str, data: &[u8], meta: Metadata) -> Result<()> {
        let path = self.prepare_write(path)?;
        let (shard, offset, crc) = self.sharder.append(data)?;
        self.record_file(FileInfo {
            path,
            shard,
            offset,
            size: data.len() as u64,
            crc32c: Some(crc),
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime_ns: meta.mtime_ns,
        })
    }

    /// Streams a blob from a reader; size and checksum are computed on
    /// the way through. Returns the stored size.
    pub fn write_from_reader(
        &mut self,
        path: &str,
        reader: &mut dyn Read,
        expected_size: Option<u64>,
        meta: Metadata,
    ) -> Result<u64> {
        let path = self.prepare_write(path)?;
        let (shard, offset, size, crc) = self.sharder.append_from_reader(reader, expected_size)?;
        self.record_file(FileInfo {
            path,
            shard,
            offset,
            size,
            crc32c: Some(crc),
            mode: meta.mode,
            uid: meta.uid,
            gid: meta.gid,
            mtime_ns: meta.mtime_ns,
        })?;
        Ok(size)
    }

    fn prepare_write(&self, path: &str) -> Result<String> {
        self.ensure_writable()?;
        let path = paths::normalize(path)?;
        if path.is_empty() {
            return Err(BarecatError::InvalidPath("cannot write to the root".into()).into());
        }
        if self.index.isfile(&path)? {
            return Err(BarecatError::AlreadyExists(path).into());
        }
        if self.index.isdir(&path)? {
            return Err(BarecatError::IsADirectory(path).into());
        }
        Ok(path)
    }

    fn record_file(&mut self, fi: FileInfo) -> Result<()> {
        let recorded = self.index.with_tx(|ix| {
            ix.ensure_ancestors(&fi.path)?;
            ix.add_file(&fi)
        });
        if recorded.is_err() {
            // The bytes were appended at the shard end; cut them back so
            // the failed write leaves no orphan region.
            let _ = self.sharder.truncate(fi.shard, fi.offset);
        }
        recorded
    }

    /// Creates a directory. The parent chain is created as needed; the
    /// directory itself must not exist.
    pub fn mkdir(&mut self, path: &str, meta: Metadata) -> Result<()> {
        self.ensure_writable()?;
        let path = paths::normalize(path)?;
        if path.is_empty() || self.index.exists(&path)? {
            return Err(BarecatError::AlreadyExists(path).into());
        }
        self.index.with_tx(|ix| {
            ix.ensure_ancestors(&path)?;
            ix.add_dir(&path, &meta, false)
        })
    }

    /// Creates a directory if missing; updates its metadata if present.
    pub fn mkdir_all(&mut self, path: &str, meta: Metadata) -> Result<()> {
        self.ensure_writable()?;
        let path = paths::normalize(path)?;
        if self.index.isfile(&path)? {
            return Err(BarecatError::NotADirectory(path).into());
        }
        self.index.with_tx(|ix| {
            ix.ensure_ancestors(&path)?;
            ix.add_dir(&path, &meta, true)
        })
    }

    // ---- deletion ---------------------------------------------------------

    /// Deletes a file or an empty directory.
    pub fn delete(&mut self, path: &str) -> Result<()> {
        self.ensure_mutable()?;
        let path = paths::normalize(path)?;
        if self.index.isfile(&path)? {
            // The blob's region stays in the shard as a gap; only defrag
            // physically reclaims it.
            self.index.with_tx(|ix| ix.remove_file(&path).map(|_| ()))?;
            return Ok(());
        }
        if self.index.isdir(&path)? {
            if path.is_empty() {
                return Err(
                    BarecatError::InvalidPath("cannot delete the root directory".into()).into(),
                );
            }
            return self.index.with_tx(|ix| ix.remove_empty_dir(&path));
        }
        Err(BarecatError::NotFound(path).into())
    }

    /// Deletes a directory and everything below it.
    pub fn remove_recursively(&mut self, path: &str) -> Result<()> {
        self.ensure_mutable()?;
        let path = paths::normalize(path)?;
        if path.is_empty() {
            return Err(
                BarecatError::InvalidPath("cannot delete the root directory".into()).into(),
            );
        }
        if !self.index.isdir(&path)? {
            if self.index.isfile(&path)? {
                return Err(BarecatError::NotADirectory(path).into());
            }
            return Err(BarecatError::NotFound(path).into());
        }
        self.index.with_tx(|ix| ix.remove_recursively(&path))
    }

    // ---- renaming ---------------------------------------------------------

    pub fn rename(&mut self, old: &str, new: &str, mode: RenameMode) -> Result<()> {
        self.ensure_mutable()?;
        let old = paths::normalize(old)?;
        let new = paths::normalize(new)?;
        if old.is_empty() || new.is_empty() {
            return Err(
                BarecatError::InvalidPath("the root directory cannot be renamed".into()).into(),
            );
        }
        if old == new {
            return Ok(());
        }
        let old_kind = self.kind_of(&old)?;
        if old_kind == EntryKind::Dir && paths::is_within(&new, &old) {
            return Err(BarecatError::InvalidPath(format!(
                "cannot move '{old}' into its own subtree '{new}'"
            ))
            .into());
        }

        match mode {
            RenameMode::NoReplace => {
                if self.index.exists(&new)? {
                    return Err(BarecatError::AlreadyExists(new).into());
                }
                self.index.with_tx(|ix| {
                    ix.ensure_ancestors(&new)?;
                    Self::rename_one(ix, old_kind, &old, &new)
                })
            }
            RenameMode::Replace => {
                match (old_kind, self.index.isfile(&new)?, self.index.isdir(&new)?) {
                    (EntryKind::File, _, true) => Err(BarecatError::IsADirectory(new).into()),
                    (EntryKind::Dir, true, _) => Err(BarecatError::NotADirectory(new).into()),
                    (kind, target_is_file, target_is_dir) => self.index.with_tx(|ix| {
                        if target_is_file {
                            ix.remove_file(&new)?;
                        } else if target_is_dir {
                            // Only an empty directory can be replaced.
                            ix.remove_empty_dir(&new)?;
                        }
                        ix.ensure_ancestors(&new)?;
                        Self::rename_one(ix, kind, &old, &new)
                    }),
                }
            }
            RenameMode::Exchange => {
                let new_kind = self.kind_of(&new)?;
                if new_kind == EntryKind::Dir && paths::is_within(&old, &new) {
                    return Err(BarecatError::InvalidPath(format!(
                        "cannot exchange '{new}' with its own subtree '{old}'"
                    ))
                    .into());
                }
                self.index.with_tx(|ix| {
                    Self::rename_one(ix, old_kind, &old, EXCHANGE_TMP)?;
                    Self::rename_one(ix, new_kind, &new, &old)?;
                    Self::rename_one(ix, old_kind, EXCHANGE_TMP, &new)
                })
            }
        }
    }

    fn kind_of(&self, path: &str) -> Result<EntryKind> {
        if self.index.isfile(path)? {
            Ok(EntryKind::File)
        } else if self.index.isdir(path)? {
            Ok(EntryKind::Dir)
        } else {
            Err(BarecatError::NotFound(path.to_string()).into())
        }
    }

    fn rename_one(ix: &Index, kind: EntryKind, old: &str, new: &str) -> Result<()> {
        match kind {
            EntryKind::File => ix.rename_file(old, new),
            EntryKind::Dir => ix.rename_dir(old, new),
        }
    }

    // ---- metadata ---------------------------------------------------------

    pub fn chmod(&mut self, path: &str, mode: u32) -> Result<()> {
        self.ensure_mutable()?;
        let path = paths::normalize(path)?;
        self.index.chmod(&path, mode)
    }

    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.ensure_mutable()?;
        let path = paths::normalize(path)?;
        self.index.chown(&path, uid, gid)
    }

    pub fn utime(&mut self, path: &str, mtime_ns: i64) -> Result<()> {
        self.ensure_mutable()?;
        let path = paths::normalize(path)?;
        self.index.set_mtime(&path, mtime_ns)
    }

    /// Changes a file's size. Shrinking updates the record in place and
    /// leaves the tail bytes as a gap; growing re-appends the blob
    /// zero-padded, since blobs are never rewritten in place.
    pub fn truncate(&mut self, path: &str, new_size: u64) -> Result<()> {
        self.ensure_mutable()?;
        let fi = self.lookup_file_checked(path)?;
        if new_size == fi.size {
            return Ok(());
        }
        if new_size < fi.size {
            let crc = self.crc32c_from_address(fi.shard, fi.offset, new_size)?;
            return self
                .index
                .with_tx(|ix| ix.set_file_size(&fi.path, new_size, Some(crc)));
        }

        let mut data = self.sharder.read(fi.shard, fi.offset, fi.size)?;
        data.resize(new_size as usize, 0);
        let (shard, offset, crc) = self.sharder.append(&data)?;
        let recorded = self.index.with_tx(|ix| {
            ix.remove_file(&fi.path)?;
            ix.add_file(&FileInfo {
                path: fi.path.clone(),
                shard,
                offset,
                size: new_size,
                crc32c: Some(crc),
                mode: fi.mode,
                uid: fi.uid,
                gid: fi.gid,
                mtime_ns: fi.mtime_ns,
            })
        });
        if recorded.is_err() {
            let _ = self.sharder.truncate(shard, offset);
        }
        recorded
    }

    // ---- directory view ---------------------------------------------------

    /// Immediate children of a directory, split into subdirectory names
    /// and file names.
    pub fn listdir(&self, path: &str) -> Result<(Vec<String>, Vec<String>)> {
        let (subdirs, files) = self.iterdir_infos(path)?;
        Ok((
            subdirs
                .into_iter()
                .map(|d| paths::basename(&d.path).to_string())
                .collect(),
            files
                .into_iter()
                .map(|f| paths::basename(&f.path).to_string())
                .collect(),
        ))
    }

    /// Immediate children with their full stat records.
    pub fn iterdir_infos(&self, path: &str) -> Result<(Vec<DirInfo>, Vec<FileInfo>)> {
        let dinfo = self.lookup_dir_checked(path)?;
        Ok((
            self.index.list_subdirs(&dinfo.path)?,
            self.index.list_files(&dinfo.path)?,
        ))
    }

    /// Lazy pre-order walk; directories are listed only as the iterator
    /// advances, so huge trees stream.
    pub fn walk(&self, path: &str) -> Result<Walk<'_>> {
        let dinfo = self.lookup_dir_checked(path)?;
        self.index.walk(&dinfo.path)
    }

    /// Like [`Barecat::walk`], yielding `(dirpath, subdir names, file
    /// names)` triples.
    pub fn walk_names(
        &self,
        path: &str,
    ) -> Result<impl Iterator<Item = Result<(String, Vec<String>, Vec<String>)>> + '_> {
        Ok(self.walk(path)?.map(|item| {
            item.map(|(dir, subdirs, files)| {
                (
                    dir.path,
                    subdirs
                        .into_iter()
                        .map(|d| paths::basename(&d.path).to_string())
                        .collect(),
                    files
                        .into_iter()
                        .map(|f| paths::basename(&f.path).to_string())
                        .collect(),
                )
            })
        }))
    }

    /// File paths matching a glob pattern, in path order.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern = paths::normalize(pattern)?;
        self.index.glob_files(&pattern)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.index.exists(&paths::normalize(path)?)
    }

    pub fn isfile(&self, path: &str) -> Result<bool> {
        self.index.isfile(&paths::normalize(path)?)
    }

    pub fn isdir(&self, path: &str) -> Result<bool> {
        self.index.isdir(&paths::normalize(path)?)
    }

    pub fn stat(&self, path: &str) -> Result<EntryInfo> {
        let path = paths::normalize(path)?;
        if let Some(fi) = self.index.try_lookup_file(&path)? {
            return Ok(EntryInfo::File(fi));
        }
        if let Some(di) = self.index.try_lookup_dir(&path)? {
            return Ok(EntryInfo::Dir(di));
        }
        Err(BarecatError::NotFound(path).into())
    }

    pub fn num_files(&self) -> Result<u64> {
        self.index.num_files()
    }

    pub fn num_dirs(&self) -> Result<u64> {
        self.index.num_dirs()
    }

    /// Sum of all file sizes, served in O(1) from the root aggregates.
    pub fn total_size(&self) -> Result<u64> {
        self.index.total_size()
    }

    pub fn total_physical_size(&self) -> Result<u64> {
        self.sharder.total_physical_size()
    }

    pub fn num_shards(&self) -> u32 {
        self.sharder.num_shards()
    }

    pub fn shard_size_limit(&self) -> u64 {
        self.sharder.shard_size_limit()
    }

    pub fn set_shard_size_limit(&mut self, limit: u64) -> Result<()> {
        self.ensure_writable()?;
        self.index.set_shard_size_limit(limit)?;
        self.sharder.set_shard_size_limit(limit);
        Ok(())
    }

    // ---- bulk loading -----------------------------------------------------

    /// Switches the aggregate triggers off (or back on) for bulk imports.
    /// While off, directory aggregates go stale; finish with
    /// [`Barecat::rebuild_aggregates`].
    pub fn set_triggers_enabled(&mut self, enabled: bool) -> Result<()> {
        self.ensure_writable()?;
        self.index.set_triggers_enabled(enabled)
    }

    /// Recomputes every directory aggregate from scratch in one pass.
    pub fn rebuild_aggregates(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.index.rebuild_aggregates()
    }

    // ---- maintenance ------------------------------------------------------

    /// Compacts the shard files; returns the number of physical bytes
    /// released.
    pub fn defrag(&mut self, mode: DefragMode) -> Result<u64> {
        self.ensure_mutable()?;
        let mut defragger = Defragger::new(&self.index, &mut self.sharder);
        let freed = match mode {
            DefragMode::Full => defragger.full()?,
            DefragMode::Quick => defragger.quick()?,
        };
        debug!(freed, ?mode, "defrag finished");
        Ok(freed)
    }

    /// Checks stored checksums (one file, or the whole archive plus the
    /// directory aggregates when `path` is `None`) and reports every
    /// divergence found.
    pub fn verify(&self, path: Option<&str>) -> Result<Vec<VerifyIssue>> {
        let mut issues = Vec::new();
        match path {
            Some(p) => {
                let fi = self.lookup_file_checked(p)?;
                self.verify_file(&fi, &mut issues)?;
            }
            None => {
                for fi in self.index.all_files(Order::Address)? {
                    self.verify_file(&fi, &mut issues)?;
                }
                for path in self.index.verify_aggregates()? {
                    issues.push(VerifyIssue::AggregateMismatch { path });
                }
            }
        }
        Ok(issues)
    }

    fn verify_file(&self, fi: &FileInfo, issues: &mut Vec<VerifyIssue>) -> Result<()> {
        if fi.end() > self.sharder.physical_end(fi.shard)? {
            issues.push(VerifyIssue::RegionOutOfBounds {
                path: fi.path.clone(),
            });
            return Ok(());
        }
        if let Some(expected) = fi.crc32c {
            let actual = self.crc32c_from_address(fi.shard, fi.offset, fi.size)?;
            if actual != expected {
                issues.push(VerifyIssue::ChecksumMismatch {
                    path: fi.path.clone(),
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Closes the session, releasing maps, file handles and the writer
    /// lock. Dropping the session does the same without error reporting.
    pub fn close(self) -> Result<()> {
        let Barecat {
            index,
            sharder,
            mapped,
            lock,
            ..
        } = self;
        drop(mapped);
        drop(sharder);
        index.close()?;
        drop(lock);
        Ok(())
    }
}

/// Seekable read-only view of one blob, backed by a duplicated shard
/// handle; positional reads keep it independent of the session's own I/O.
#[derive(Debug)]
pub struct BlobStream {
    file: File,
    start: u64,
    size: u64,
    pos: u64,
}

impl BlobStream {
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for BlobStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = self.file.read_at(&mut buf[..want], self.start + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for BlobStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.size as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of blob",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

fn lock_exclusive(file: &File) -> Result<()> {
    // SQLite's own locking uses fcntl byte ranges, which do not interact
    // with flock; holding this for the session lifetime is what makes the
    // archive single-writer.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Err(BarecatError::ConcurrentWriter.into());
    }
    Err(eyre::Report::new(err).wrap_err("failed to lock the index file"))
}
