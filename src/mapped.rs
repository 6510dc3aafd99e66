//! # Memory-Mapped Read Path
//!
//! Readers that want zero-copy access map every shard once at session
//! open (`PROT_READ`, `MAP_PRIVATE`) and hand out `&[u8]` borrows of the
//! mapped regions instead of freshly allocated buffers.
//!
//! ## Lifetime discipline
//!
//! A borrowed blob is only valid while its mapping exists. Rather than
//! guarding this at runtime, the borrow checker enforces it: [`MappedShards::blob`]
//! borrows `&self`, the mapping set is owned by the session, and dropping
//! the session (or the session's close consuming `self`) first requires
//! every outstanding borrow to be gone. A blob slice can therefore never
//! outlive the session at compile time.
//!
//! ## Concurrency
//!
//! The maps are private and read-only, so any number of threads inside one
//! session may read concurrently, and independent reader sessions on the
//! same archive files each hold their own maps. Mappings are only created
//! for read-only sessions: a writer appending to a shard would grow the
//! file past the fixed mapping length, and truncation during
//! defragmentation would invalidate mapped tails.

use std::fs::File;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use crate::sharder::{Sharder, CRC32C};

#[derive(Debug)]
pub struct MappedShards {
    /// One map per shard; `None` for zero-length shards, which cannot be
    /// mapped and hold no readable bytes anyway.
    maps: Vec<Option<Mmap>>,
}

impl MappedShards {
    /// Maps every shard of an open store.
    pub fn map_all(sharder: &Sharder) -> Result<Self> {
        let mut maps = Vec::with_capacity(sharder.num_shards() as usize);
        for index in 0..sharder.num_shards() {
            let file = sharder.clone_handle(index)?;
            maps.push(map_shard(&file, index)?);
        }
        Ok(Self { maps })
    }

    pub fn num_shards(&self) -> u32 {
        self.maps.len() as u32
    }

    /// Borrows the bytes of one blob region. The returned slice lives as
    /// long as `self`, i.e. as long as the session holding the maps.
    pub fn blob(&self, shard: u32, offset: u64, size: u64) -> Result<&[u8]> {
        let map = self
            .maps
            .get(shard as usize)
            .ok_or_else(|| eyre::eyre!("shard {shard} is not mapped"))?;
        if size == 0 {
            return Ok(&[]);
        }
        let map = map
            .as_ref()
            .ok_or_else(|| eyre::eyre!("shard {shard} is empty"))?;
        let start = offset as usize;
        let end = start + size as usize;
        ensure!(
            end <= map.len(),
            "region [{offset}, {end}) is out of bounds for shard {shard} of {} bytes",
            map.len()
        );
        Ok(&map[start..end])
    }

    /// CRC32C over a mapped region, without copying.
    pub fn crc32c_of(&self, shard: u32, offset: u64, size: u64) -> Result<u32> {
        Ok(CRC32C.checksum(self.blob(shard, offset, size)?))
    }
}

fn map_shard(file: &File, index: u32) -> Result<Option<Mmap>> {
    let len = file
        .metadata()
        .wrap_err_with(|| format!("failed to stat shard {index}"))?
        .len();
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: mapping a file is unsafe because the underlying bytes can
    // change under us if another process writes the file. The archive
    // contract is single-writer/multi-reader with mappings created only in
    // read-only sessions; a concurrent writer only ever appends past the
    // mapped length or rewrites unreferenced regions, and the map is
    // private (copy-on-write), so referenced bytes seen through it stay
    // stable. All access goes through blob(), which bounds-checks.
    let map = unsafe {
        MmapOptions::new()
            .map_copy_read_only(file)
            .wrap_err_with(|| format!("failed to map shard {index}"))?
    };
    Ok(Some(map))
}
