//! # Defragmentation
//!
//! Deletions, truncations and aborted writes leave gaps: shard regions no
//! file row references. The defragmenter finds them from the index alone
//! (blobs ordered by address, plus wholly unreferenced shards) and closes
//! them by moving blobs toward the start of the shard set.
//!
//! Two strategies:
//!
//! - **Full**: walk blobs in (shard, offset) order, sliding each one back
//!   to the packing cursor. Produces a perfectly packed archive — every
//!   shard's length equals the sum of the blob sizes it holds — at the
//!   cost of rewriting everything behind the first gap.
//! - **Quick**: walk blobs in reverse address order and drop each into the
//!   earliest gap that fits. Stops at the first blob with no earlier fit,
//!   since blobs before it have even less room ahead of them. Cheap, and
//!   total gap bytes never increase.
//!
//! Every relocation commits its index update in its own transaction right
//! after the bytes are copied, so an interrupted run leaves a fully
//! consistent, partially compacted archive: the worst leftover is a moved
//! copy whose old region simply stays a gap. Freed tails are truncated
//! only at the end.

use eyre::Result;
use tracing::debug;

use crate::index::Index;
use crate::info::{FileInfo, Order};
use crate::sharder::Sharder;

/// One unreferenced region of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub shard: u32,
    pub offset: u64,
    pub size: u64,
}

pub(crate) struct Defragger<'a> {
    index: &'a Index,
    sharder: &'a mut Sharder,
}

impl<'a> Defragger<'a> {
    pub fn new(index: &'a Index, sharder: &'a mut Sharder) -> Self {
        Self { index, sharder }
    }

    /// All gaps in address order. Interior and head gaps come from the
    /// index; a shard with no rows at all is one whole gap, bounded by the
    /// shard size limit.
    pub fn gaps(&self) -> Result<Vec<Gap>> {
        let mut gaps: Vec<Gap> = self
            .index
            .gap_rows()?
            .into_iter()
            .map(|(shard, offset, size)| Gap {
                shard,
                offset,
                size,
            })
            .collect();
        let cap = self.sharder.shard_size_limit();
        for shard in 0..self.sharder.num_shards() {
            if self.index.logical_shard_end(shard)? == 0 {
                gaps.push(Gap {
                    shard,
                    offset: 0,
                    size: cap,
                });
            }
        }
        gaps.sort_by_key(|g| (g.shard, g.offset));
        Ok(gaps)
    }

    /// Exhaustive forward packing. Returns the number of physical bytes
    /// released.
    pub fn full(&mut self) -> Result<u64> {
        let before = self.sharder.total_physical_size()?;
        let files = self.index.all_files(Order::Address)?;
        let cap = self.sharder.shard_size_limit();

        let mut dst_shard = 0u32;
        let mut dst_offset = 0u64;
        for fi in &files {
            if dst_offset + fi.size > cap {
                // The packed prefix of this shard is final; seal it.
                self.sharder.truncate(dst_shard, dst_offset)?;
                dst_shard += 1;
                dst_offset = 0;
            }
            if dst_shard != fi.shard || dst_offset != fi.offset {
                debug!(
                    path = %fi.path,
                    from = ?(fi.shard, fi.offset),
                    to = ?(dst_shard, dst_offset),
                    "defrag: packing blob"
                );
                self.sharder
                    .copy_range(fi.shard, fi.offset, dst_shard, dst_offset, fi.size)?;
                self.index
                    .with_tx(|ix| ix.move_file(&fi.path, dst_shard, dst_offset))?;
            }
            dst_offset += fi.size;
        }

        self.sharder.truncate(dst_shard, dst_offset)?;
        self.sharder.remove_shards_after(dst_shard)?;
        Ok(before.saturating_sub(self.sharder.total_physical_size()?))
    }

    /// First-fit-from-the-end packing. Returns the number of physical
    /// bytes released.
    pub fn quick(&mut self) -> Result<u64> {
        let before = self.sharder.total_physical_size()?;
        let mut gaps = self.gaps()?;

        for fi in self.index.all_files(Order::AddressDesc)? {
            if fi.size == 0 {
                continue;
            }
            if !self.move_to_earlier_gap(&fi, &mut gaps)? {
                // No room for this blob means even less room for the
                // lower-addressed ones behind it.
                break;
            }
        }

        let mut ends = Vec::with_capacity(self.sharder.num_shards() as usize);
        for shard in 0..self.sharder.num_shards() {
            ends.push(self.index.logical_shard_end(shard)?);
        }
        self.sharder.truncate_to_logical(&ends)?;
        Ok(before.saturating_sub(self.sharder.total_physical_size()?))
    }

    fn move_to_earlier_gap(&mut self, fi: &FileInfo, gaps: &mut Vec<Gap>) -> Result<bool> {
        let mut chosen = None;
        for (i, gap) in gaps.iter().enumerate() {
            if gap.shard > fi.shard || (gap.shard == fi.shard && gap.offset >= fi.offset) {
                // Gaps are address-ordered; everything from here on lies
                // at or behind the blob itself.
                break;
            }
            if gap.size >= fi.size {
                chosen = Some(i);
                break;
            }
        }
        let Some(i) = chosen else {
            return Ok(false);
        };

        let gap = gaps[i];
        debug!(
            path = %fi.path,
            from = ?(fi.shard, fi.offset),
            to = ?(gap.shard, gap.offset),
            "defrag: filling gap"
        );
        self.sharder
            .copy_range(fi.shard, fi.offset, gap.shard, gap.offset, fi.size)?;
        self.index
            .with_tx(|ix| ix.move_file(&fi.path, gap.shard, gap.offset))?;

        gaps[i].offset += fi.size;
        gaps[i].size -= fi.size;
        if gaps[i].size == 0 {
            gaps.remove(i);
        }
        Ok(true)
    }
}
