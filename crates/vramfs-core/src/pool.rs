//! The VRAM block pool.
//!
//! Pre-allocates a bounded supply of fixed-size device buffers and recycles
//! them as files grow and shrink. Pre-allocation at startup makes
//! out-of-memory a bounded, predictable event that surfaces as short writes
//! rather than allocation failures deep in the write path.

use crate::block::Block;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use vramfs_device::{ComputeDevice, DeviceBuffer};
use vramfs_types::BLOCK_SIZE;

pub(crate) struct PoolInner {
    device: Arc<dyn ComputeDevice>,
    /// LIFO free list. Buffers are not re-zeroed on return; the next owner
    /// zero-fills on first use if needed.
    free: Mutex<Vec<Box<dyn DeviceBuffer>>>,
    /// Total buffers ever allocated.
    total: AtomicU64,
}

impl PoolInner {
    pub(crate) fn reclaim(&self, buffer: Box<dyn DeviceBuffer>) {
        self.free.lock().push(buffer);
    }
}

/// Bounded supply of pre-allocated device buffers.
#[derive(Clone)]
pub struct BlockPool {
    inner: Arc<PoolInner>,
}

impl BlockPool {
    #[must_use]
    pub fn new(device: Arc<dyn ComputeDevice>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                device,
                free: Mutex::new(Vec::new()),
                total: AtomicU64::new(0),
            }),
        }
    }

    /// Grow the pool by `ceil(bytes / BLOCK_SIZE)` zero-filled buffers.
    ///
    /// Stops at the first allocation failure and returns the bytes actually
    /// added, which may be less than requested.
    pub fn grow(&self, bytes: u64) -> u64 {
        let want = bytes.div_ceil(BLOCK_SIZE as u64);
        let mut added = 0_u64;

        for _ in 0..want {
            let mut buffer = match self.inner.device.create_buffer(BLOCK_SIZE as u64) {
                Ok(buffer) => buffer,
                Err(err) => {
                    debug!(target: "vramfs::pool", error = %err, "pool growth stopped");
                    break;
                }
            };
            if let Err(err) = buffer.fill_zero() {
                debug!(target: "vramfs::pool", error = %err, "pool growth stopped");
                break;
            }
            self.inner.free.lock().push(buffer);
            self.inner.total.fetch_add(1, Ordering::Relaxed);
            added += BLOCK_SIZE as u64;
        }

        info!(
            target: "vramfs::pool",
            requested = bytes,
            added,
            total_blocks = self.total_blocks(),
            "pool grown"
        );
        added
    }

    /// Hand out one pooled buffer as a fresh [`Block`], or `None` if the
    /// free list is empty.
    #[must_use]
    pub fn allocate(&self) -> Option<Block> {
        let buffer = self.inner.free.lock().pop()?;
        Some(Block::new(Arc::clone(&self.inner), buffer))
    }

    /// Total buffers ever allocated into the pool.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Buffers currently on the free list.
    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.inner.free.lock().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vramfs_device::HostDevice;

    fn pool_with_blocks(count: u64) -> BlockPool {
        let pool = BlockPool::new(Arc::new(HostDevice::new()));
        assert_eq!(
            pool.grow(count * BLOCK_SIZE as u64),
            count * BLOCK_SIZE as u64
        );
        pool
    }

    #[test]
    fn grow_rounds_up_to_whole_blocks() {
        let pool = BlockPool::new(Arc::new(HostDevice::new()));
        assert_eq!(pool.grow(1), BLOCK_SIZE as u64);
        assert_eq!(pool.total_blocks(), 1);
    }

    #[test]
    fn grow_reports_shortfall_on_allocation_failure() {
        let device = HostDevice::with_budget(2 * BLOCK_SIZE as u64);
        let pool = BlockPool::new(Arc::new(device));
        assert_eq!(pool.grow(5 * BLOCK_SIZE as u64), 2 * BLOCK_SIZE as u64);
        assert_eq!(pool.total_blocks(), 2);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn allocate_until_exhausted_then_none() {
        let pool = pool_with_blocks(2);
        let a = pool.allocate().expect("first block");
        let b = pool.allocate().expect("second block");
        assert!(pool.allocate().is_none());
        assert_eq!(pool.free_blocks(), 0);

        drop(a);
        drop(b);
        assert_eq!(pool.free_blocks(), 2);
        assert_eq!(pool.total_blocks(), 2);
    }

    #[test]
    fn free_plus_live_equals_total() {
        let pool = pool_with_blocks(3);
        let live = pool.allocate().expect("block");
        assert_eq!(pool.free_blocks() + 1, pool.total_blocks());
        drop(live);
        assert_eq!(pool.free_blocks(), pool.total_blocks());
    }
}
