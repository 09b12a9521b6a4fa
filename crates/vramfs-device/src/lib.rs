#![forbid(unsafe_code)]
//! Compute-device seam for vramfs.
//!
//! The engine stores file contents in opaque device buffers reached only
//! through a command queue, so this crate abstracts the runtime behind the
//! [`ComputeDevice`] / [`DeviceBuffer`] / [`WriteFence`] traits:
//!
//! - **[`GpuDevice`]**: the real backend, driving GPU memory through `wgpu`.
//! - **[`HostDevice`]**: plain host memory for tests and benchmarks, with an
//!   optional allocation budget to provoke out-of-memory paths.
//!
//! # Ordering
//!
//! Every backend executes submissions against one buffer in submission
//! order (an in-order queue), so a `read_at` observes all `write_at` calls
//! issued before it without explicit fencing. `wgpu` hides the unsafe
//! driver interface internally; this crate stays fully safe.

mod gpu;
mod host;

pub use gpu::{list_devices, GpuDevice};
pub use host::HostDevice;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no compatible GPU found")]
    NoAdapter,

    #[error("device index {index} out of range ({count} devices)")]
    BadIndex { index: usize, count: usize },

    #[error("device request failed: {0}")]
    Request(String),

    #[error("device out of memory")]
    OutOfMemory,

    #[error("transfer failed: {0}")]
    Transfer(String),
}

/// Result alias using `DeviceError`.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// One enumerated compute device, for `--list-devices`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: usize,
    pub name: String,
    pub backend: String,
    pub device_type: String,
}

/// An opaque provider of device buffers.
pub trait ComputeDevice: Send + Sync {
    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Allocate one buffer of `len` bytes of device memory.
    ///
    /// `len` must be a multiple of 8 (all engine buffers are whole blocks).
    fn create_buffer(&self, len: u64) -> Result<Box<dyn DeviceBuffer>>;
}

/// One region of device memory, reached only through queue submissions.
pub trait DeviceBuffer: Send {
    /// Buffer length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocking read of `dst.len()` bytes starting at `offset`.
    ///
    /// Completes after every previously submitted write to this buffer.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()>;

    /// Asynchronous write of `src` starting at `offset`.
    ///
    /// The backend owns a copy of `src` until the transfer completes, so
    /// the caller's slice is reusable the moment this returns. The fence
    /// tracks completion of this write.
    fn write_at(&mut self, offset: u64, src: &[u8]) -> Result<Box<dyn WriteFence>>;

    /// Clear the whole buffer to zero, queued like any other submission.
    fn fill_zero(&mut self) -> Result<()>;
}

/// Completion handle for one asynchronous write.
pub trait WriteFence: Send {
    /// Block until the tracked write has completed on the device.
    fn wait(&self) -> Result<()>;
}
