//! The per-file sparse block map.
//!
//! An ordered mapping from block-aligned start offset to an owned block.
//! Gaps are ranges that were never written and read as zeros. The logical
//! file size is independent of how many blocks are populated.

use crate::block::Block;
use crate::pool::BlockPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use vramfs_error::Result;
use vramfs_types::BLOCK_SIZE;

pub(crate) struct FileBody {
    size: u64,
    blocks: BTreeMap<u64, Arc<Block>>,
    /// Start offset and handle of the most recently written block.
    /// Waiting on it covers every earlier write, because the device queue
    /// is in-order.
    last_written: Option<(u64, Arc<Block>)>,
}

impl FileBody {
    pub(crate) fn new() -> Self {
        Self {
            size: 0,
            blocks: BTreeMap::new(),
            last_written: None,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Grow the logical size to at least `offset`.
    pub(crate) fn grow_to(&mut self, offset: u64) {
        if self.size < offset {
            self.size = offset;
        }
    }

    /// The block starting at `block_start`, if populated.
    pub(crate) fn block_at(&self, block_start: u64) -> Option<Arc<Block>> {
        self.blocks.get(&block_start).cloned()
    }

    /// The block starting at `block_start`, drawing a fresh one from the
    /// pool if the offset is unpopulated. `None` means the pool is empty.
    pub(crate) fn block_at_or_alloc(
        &mut self,
        block_start: u64,
        pool: &BlockPool,
    ) -> Option<Arc<Block>> {
        if let Some(block) = self.blocks.get(&block_start) {
            return Some(Arc::clone(block));
        }
        let block = Arc::new(pool.allocate()?);
        self.blocks.insert(block_start, Arc::clone(&block));
        Some(block)
    }

    pub(crate) fn note_write(&mut self, block_start: u64, block: &Arc<Block>) {
        self.last_written = Some((block_start, Arc::clone(block)));
    }

    /// Wait until the most recent write has completed on the device.
    pub(crate) fn sync(&self) -> Result<()> {
        if let Some((_, block)) = &self.last_written {
            block.sync()?;
        }
        Ok(())
    }

    /// Set the logical size, dropping every block whose start offset lies
    /// at or beyond the first block boundary at or after `new_size`.
    pub(crate) fn truncate(&mut self, new_size: u64) {
        if new_size < self.size {
            let boundary = new_size.next_multiple_of(BLOCK_SIZE as u64);
            let _dropped = self.blocks.split_off(&boundary);
            // Drop the fsync reference too if its block just went away, so
            // the buffer actually returns to the pool.
            if matches!(self.last_written, Some((start, _)) if start >= boundary) {
                self.last_written = None;
            }
        }
        self.size = new_size;
    }

    #[cfg(test)]
    pub(crate) fn populated_offsets(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }
}
