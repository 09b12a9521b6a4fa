//! Host-memory backend for tests and benchmarks.
//!
//! All I/O operates on a `Vec<u8>` per buffer, eliminating device latency.
//! An optional byte budget makes allocation failure reproducible, which is
//! how the pool-exhaustion paths are tested without a real GPU.

use crate::{ComputeDevice, DeviceBuffer, DeviceError, Result, WriteFence};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct HostDevice {
    budget: Option<Arc<Mutex<u64>>>,
}

impl HostDevice {
    /// Backend with unlimited memory.
    #[must_use]
    pub fn new() -> Self {
        Self { budget: None }
    }

    /// Backend that refuses allocations once `bytes` are outstanding.
    #[must_use]
    pub fn with_budget(bytes: u64) -> Self {
        Self {
            budget: Some(Arc::new(Mutex::new(bytes))),
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for HostDevice {
    fn name(&self) -> &str {
        "host memory"
    }

    fn create_buffer(&self, len: u64) -> Result<Box<dyn DeviceBuffer>> {
        if let Some(budget) = &self.budget {
            let mut remaining = budget.lock();
            if *remaining < len {
                return Err(DeviceError::OutOfMemory);
            }
            *remaining -= len;
        }
        Ok(Box::new(HostBuffer {
            data: vec![0_u8; usize::try_from(len).map_err(|_| DeviceError::OutOfMemory)?],
            budget: self.budget.clone(),
        }))
    }
}

struct HostBuffer {
    data: Vec<u8>,
    budget: Option<Arc<Mutex<u64>>>,
}

impl HostBuffer {
    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset)
            .map_err(|_| DeviceError::Transfer("offset out of range".to_owned()))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| DeviceError::Transfer("access past end of buffer".to_owned()))?;
        Ok(start..end)
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(budget) = &self.budget {
            *budget.lock() += self.data.len() as u64;
        }
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let range = self.range(offset, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> Result<Box<dyn WriteFence>> {
        let range = self.range(offset, src.len())?;
        self.data[range].copy_from_slice(src);
        Ok(Box::new(HostFence))
    }

    fn fill_zero(&mut self) -> Result<()> {
        self.data.fill(0);
        Ok(())
    }
}

/// Host writes complete before `write_at` returns.
struct HostFence;

impl WriteFence for HostFence {
    fn wait(&self) -> Result<()> {
        Ok(())
    }
}
