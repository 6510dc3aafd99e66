//! # Shard Store
//!
//! Blob bytes live in numbered shard files next to the index:
//! `<base>-shard-00000`, `<base>-shard-00001`, ... Each shard is a pure
//! concatenation of blobs with no header, no footer and no alignment; a
//! reader in any language only needs to seek and read. Shards are
//! append-only during normal writing; rewriting happens only during
//! defragmentation, and truncation only ever cuts unreferenced tails.
//!
//! ## Allocation
//!
//! [`Sharder::append`] places each blob at the current end of the last
//! shard. When the blob would push the shard past the configured size
//! limit, a new shard is started first; a blob larger than the limit
//! itself can never be stored. For streaming sources of unknown size the
//! overrun is only discovered after the copy, in which case the freshly
//! written region is transferred to a new shard and the old tail is cut
//! ([`Sharder::append_from_reader`]).
//!
//! ## I/O discipline
//!
//! Reads use positional I/O (`read_exact_at`), so they take `&self` and
//! concurrent readers within a session never contend on a file cursor.
//! All writes go through `write_all_at` against explicitly computed
//! offsets; no method depends on the OS file position.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{bail, ensure, Result, WrapErr};

use crate::error::BarecatError;

/// CRC32C (Castagnoli), the checksum stored alongside each blob.
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Computes the CRC32C of a byte slice in one shot.
pub fn crc32c(data: &[u8]) -> u32 {
    CRC32C.checksum(data)
}

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Path of shard number `index` for a given archive base path.
pub fn shard_path(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("-shard-{index:05}"));
    PathBuf::from(name)
}

#[derive(Debug)]
struct ShardFile {
    file: File,
    path: PathBuf,
}

#[derive(Debug)]
pub struct Sharder {
    base: PathBuf,
    shards: Vec<ShardFile>,
    readonly: bool,
    shard_size_limit: u64,
}

impl Sharder {
    /// Opens the existing shard set for `base`, discovered by scanning the
    /// directory for `-shard-NNNNN` siblings. A writer with no existing
    /// shards gets shard 00000 created on the spot.
    pub fn open(base: &Path, readonly: bool, shard_size_limit: u64) -> Result<Self> {
        let count = discover_shard_count(base)?;
        let mut shards = Vec::with_capacity(count as usize);
        for i in 0..count {
            let path = shard_path(base, i);
            let file = open_shard(&path, readonly)?;
            shards.push(ShardFile { file, path });
        }
        let mut sharder = Self {
            base: base.to_path_buf(),
            shards,
            readonly,
            shard_size_limit,
        };
        if sharder.shards.is_empty() && !readonly {
            sharder.start_new_shard()?;
        }
        Ok(sharder)
    }

    /// Deletes every shard file of an archive; used by overwrite-mode open.
    pub fn remove_all(base: &Path) -> Result<()> {
        let count = discover_shard_count(base)?;
        for i in 0..count {
            let path = shard_path(base, i);
            fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove shard '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Whether any shard file exists for `base`.
    pub fn any_exists(base: &Path) -> bool {
        shard_path(base, 0).exists()
    }

    pub fn num_shards(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn shard_size_limit(&self) -> u64 {
        self.shard_size_limit
    }

    pub fn set_shard_size_limit(&mut self, limit: u64) {
        self.shard_size_limit = limit;
    }

    fn shard(&self, index: u32) -> Result<&ShardFile> {
        self.shards.get(index as usize).ok_or_else(|| {
            BarecatError::CorruptIndex(format!(
                "shard {index} is referenced but only {} shard files exist",
                self.shards.len()
            ))
            .into()
        })
    }

    /// Current physical length of a shard file.
    pub fn physical_end(&self, index: u32) -> Result<u64> {
        let shard = self.shard(index)?;
        let meta = shard
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to stat shard '{}'", shard.path.display()))?;
        Ok(meta.len())
    }

    pub fn total_physical_size(&self) -> Result<u64> {
        let mut total = 0;
        for i in 0..self.num_shards() {
            total += self.physical_end(i)?;
        }
        Ok(total)
    }

    /// Reads exactly `buf.len()` bytes at an absolute shard offset.
    pub fn read_at(&self, index: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let shard = self.shard(index)?;
        shard.file.read_exact_at(buf, offset).map_err(|source| {
            eyre::Report::new(BarecatError::ShardIo {
                shard: index,
                source,
            })
            .wrap_err(format!(
                "failed to read {} bytes at offset {offset} from '{}'",
                buf.len(),
                shard.path.display()
            ))
        })
    }

    pub fn read(&self, index: u32, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.read_at(index, offset, &mut buf)?;
        Ok(buf)
    }

    /// Duplicated handle for a shard, for streams that outlive `&self`
    /// borrows of the session.
    pub fn clone_handle(&self, index: u32) -> Result<File> {
        let shard = self.shard(index)?;
        shard
            .file
            .try_clone()
            .wrap_err_with(|| format!("failed to duplicate handle for '{}'", shard.path.display()))
    }

    /// Appends one blob, rolling over to a new shard when the current one
    /// is too full. Returns the landing address and the blob's CRC32C.
    pub fn append(&mut self, data: &[u8]) -> Result<(u32, u64, u32)> {
        self.ensure_writable()?;
        let size = data.len() as u64;
        if size > self.shard_size_limit {
            return Err(BarecatError::BlobTooLarge {
                size,
                limit: self.shard_size_limit,
            }
            .into());
        }
        let mut index = self.num_shards() - 1;
        let mut offset = self.physical_end(index)?;
        if offset + size > self.shard_size_limit {
            self.start_new_shard()?;
            index += 1;
            offset = 0;
        }
        let shard = self.shard(index)?;
        shard
            .file
            .write_all_at(data, offset)
            .wrap_err_with(|| format!("failed to append to shard '{}'", shard.path.display()))?;
        Ok((index, offset, crc32c(data)))
    }

    /// Streams a blob from a reader into the store, computing size and
    /// CRC32C on the way. If `expected_size` is known, rollover happens up
    /// front; otherwise an overrun is repaired afterwards by transferring
    /// the written region into a fresh shard and cutting the old tail.
    pub fn append_from_reader(
        &mut self,
        reader: &mut dyn Read,
        expected_size: Option<u64>,
    ) -> Result<(u32, u64, u64, u32)> {
        self.ensure_writable()?;
        if let Some(size) = expected_size {
            if size > self.shard_size_limit {
                return Err(BarecatError::BlobTooLarge {
                    size,
                    limit: self.shard_size_limit,
                }
                .into());
            }
        }
        let mut index = self.num_shards() - 1;
        let mut offset = self.physical_end(index)?;
        if let Some(size) = expected_size {
            if offset + size > self.shard_size_limit {
                self.start_new_shard()?;
                index += 1;
                offset = 0;
            }
        }

        let mut digest = CRC32C.digest();
        let mut written = 0u64;
        let mut buf = [0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).map_err(|source| {
                eyre::Report::new(source).wrap_err("failed to read blob source")
            })?;
            if n == 0 {
                break;
            }
            let shard = self.shard(index)?;
            shard
                .file
                .write_all_at(&buf[..n], offset + written)
                .wrap_err_with(|| {
                    format!("failed to append to shard '{}'", shard.path.display())
                })?;
            digest.update(&buf[..n]);
            written += n as u64;
        }
        let crc = digest.finalize();

        if let Some(size) = expected_size {
            if size != written {
                self.truncate(index, offset)?;
                bail!("blob source produced {written} bytes, expected {size}");
            }
        }
        if written > self.shard_size_limit {
            self.truncate(index, offset)?;
            return Err(BarecatError::BlobTooLarge {
                size: written,
                limit: self.shard_size_limit,
            }
            .into());
        }
        if offset + written > self.shard_size_limit {
            // Unknown-size stream overran the cap: move the region to a
            // fresh shard, then cut it from the old one.
            self.start_new_shard()?;
            let new_index = index + 1;
            self.copy_range(index, offset, new_index, 0, written)?;
            self.truncate(index, offset)?;
            return Ok((new_index, 0, written, crc));
        }
        Ok((index, offset, written, crc))
    }

    /// Creates the next numbered shard file.
    pub fn start_new_shard(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let path = shard_path(&self.base, self.shards.len() as u32);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create shard '{}'", path.display()))?;
        self.shards.push(ShardFile { file, path });
        Ok(())
    }

    pub fn truncate(&mut self, index: u32, len: u64) -> Result<()> {
        self.ensure_writable()?;
        let shard = self.shard(index)?;
        shard
            .file
            .set_len(len)
            .wrap_err_with(|| format!("failed to truncate shard '{}'", shard.path.display()))?;
        Ok(())
    }

    /// Copies `len` bytes between shard regions in chunks, front to back.
    /// Within one shard the destination must lie left of the source, which
    /// makes the forward chunk order safe on overlapping regions.
    pub fn copy_range(
        &mut self,
        src_shard: u32,
        src_offset: u64,
        dst_shard: u32,
        dst_offset: u64,
        len: u64,
    ) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            src_shard != dst_shard || dst_offset < src_offset || len == 0,
            "intra-shard copies must move data leftward"
        );
        if dst_offset + len > self.shard_size_limit {
            return Err(BarecatError::ShardCapExceeded {
                offset: dst_offset,
                size: len,
                limit: self.shard_size_limit,
            }
            .into());
        }
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut copied = 0u64;
        while copied < len {
            let n = ((len - copied) as usize).min(COPY_BUF_SIZE);
            self.read_at(src_shard, src_offset + copied, &mut buf[..n])?;
            let dst = self.shard(dst_shard)?;
            dst.file
                .write_all_at(&buf[..n], dst_offset + copied)
                .wrap_err_with(|| {
                    format!("failed to write to shard '{}'", dst.path.display())
                })?;
            copied += n as u64;
        }
        Ok(())
    }

    /// Removes shard files numbered above `last_kept` from disk.
    pub fn remove_shards_after(&mut self, last_kept: u32) -> Result<()> {
        self.ensure_writable()?;
        while self.shards.len() as u32 > last_kept + 1 {
            let shard = self.shards.pop().unwrap();
            drop(shard.file);
            fs::remove_file(&shard.path)
                .wrap_err_with(|| format!("failed to remove shard '{}'", shard.path.display()))?;
        }
        Ok(())
    }

    /// Truncates every shard to its logical end and deletes trailing
    /// shards that hold no referenced bytes at all (shard 00000 is always
    /// kept, possibly empty).
    pub fn truncate_to_logical(&mut self, logical_ends: &[u64]) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            logical_ends.len() == self.shards.len(),
            "logical end list does not match the shard count"
        );
        let mut keep = logical_ends.len();
        while keep > 1 && logical_ends[keep - 1] == 0 {
            keep -= 1;
        }
        self.remove_shards_after(keep as u32 - 1)?;
        for (i, &end) in logical_ends[..keep].iter().enumerate() {
            self.truncate(i as u32, end)?;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(BarecatError::ReadOnlyArchive.into());
        }
        Ok(())
    }
}

fn open_shard(path: &Path, readonly: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    if !readonly {
        options.write(true);
    }
    options
        .open(path)
        .wrap_err_with(|| format!("failed to open shard '{}'", path.display()))
}

/// Counts contiguous shard files for `base` starting at 00000.
fn discover_shard_count(base: &Path) -> Result<u32> {
    let mut count = 0;
    while shard_path(base, count).exists() {
        count += 1;
    }
    // A hole in the numbering means a shard file went missing.
    let parent = base.parent().unwrap_or_else(|| Path::new("."));
    let stem = base
        .file_name()
        .ok_or_else(|| BarecatError::InvalidPath(format!("bad base path '{}'", base.display())))?
        .to_string_lossy()
        .into_owned();
    let prefix = format!("{stem}-shard-");
    if parent.is_dir() {
        for entry in fs::read_dir(parent)
            .wrap_err_with(|| format!("failed to list '{}'", parent.display()))?
        {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(digits) = name.strip_prefix(&prefix) {
                if digits.len() == 5 && digits.bytes().all(|b| b.is_ascii_digit()) {
                    let n: u32 = digits.parse().unwrap_or(u32::MAX);
                    if n >= count {
                        return Err(BarecatError::CorruptIndex(format!(
                            "shard file '{name}' exists but shard {count} is missing"
                        ))
                        .into());
                    }
                }
            }
        }
    }
    Ok(count)
}
