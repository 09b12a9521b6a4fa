//! A handle to one pooled device buffer.
//!
//! A `Block` exclusively owns its buffer slot while alive and returns it to
//! the pool free list on drop, un-zeroed. The `dirty` flag is true from
//! construction until the first write completes: until then the buffer
//! holds whatever a prior owner left behind, so reads synthesize zeros and
//! partial writes zero-fill the buffer first.

use crate::pool::PoolInner;
use parking_lot::Mutex;
use std::sync::Arc;
use vramfs_device::{DeviceBuffer, WriteFence};
use vramfs_error::{Result, VramError};
use vramfs_types::BLOCK_SIZE;

pub struct Block {
    pool: Arc<PoolInner>,
    state: Mutex<BlockState>,
}

struct BlockState {
    /// Present from construction until drop.
    buffer: Option<Box<dyn DeviceBuffer>>,
    /// Contents are a prior owner's until the first write.
    dirty: bool,
    /// Most recent asynchronous write, for `sync`.
    last_write: Option<Box<dyn WriteFence>>,
}

fn device_err(err: vramfs_device::DeviceError) -> VramError {
    VramError::Device(err.to_string())
}

impl Block {
    pub(crate) fn new(pool: Arc<PoolInner>, buffer: Box<dyn DeviceBuffer>) -> Self {
        Self {
            pool,
            state: Mutex::new(BlockState {
                buffer: Some(buffer),
                dirty: true,
                last_write: None,
            }),
        }
    }

    /// Blocking read of `dst.len()` bytes starting at `offset`.
    ///
    /// The in-order queue guarantees prior writes are visible.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        if state.dirty {
            dst.fill(0);
            return Ok(());
        }
        let buffer = state.buffer.as_ref().expect("buffer present until drop");
        buffer.read_at(offset as u64, dst).map_err(device_err)
    }

    /// Write `src` at `offset`, asynchronously unless `blocking`.
    ///
    /// The caller's slice is reusable immediately either way; the backend
    /// owns a copy until the transfer completes.
    pub fn write(&self, offset: usize, src: &[u8], blocking: bool) -> Result<()> {
        let mut state = self.state.lock();
        let dirty = state.dirty;
        let buffer = state.buffer.as_mut().expect("buffer present until drop");

        // A first write that does not cover the whole block exposes the
        // prior owner's bytes around it; clear them first.
        if dirty && src.len() != BLOCK_SIZE {
            buffer.fill_zero().map_err(device_err)?;
        }

        let fence = buffer.write_at(offset as u64, src).map_err(device_err)?;
        if blocking {
            fence.wait().map_err(device_err)?;
        }
        state.last_write = Some(fence);
        state.dirty = false;
        Ok(())
    }

    /// Block until the most recent write has completed on the device.
    ///
    /// Because the queue is in-order, every earlier write to this block has
    /// then completed as well. No-op if the block was never written.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(fence) = &state.last_write {
            fence.wait().map_err(device_err)?;
        }
        Ok(())
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // The buffer goes back un-zeroed; the next owner starts dirty.
        let buffer = self.state.get_mut().buffer.take();
        if let Some(buffer) = buffer {
            self.pool.reclaim(buffer);
        }
    }
}
