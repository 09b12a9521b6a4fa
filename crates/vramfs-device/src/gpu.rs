//! GPU backend driving discrete video memory through `wgpu`.
//!
//! One adapter is selected by flattened index across the instance (CPU
//! rasterizers are skipped), giving one device and one in-order queue.
//! Writes go through `Queue::write_buffer`, which copies the payload before
//! returning; reads copy into a mappable staging buffer and block on the
//! map. The engine expects byte-granular I/O while wgpu only copies in
//! 4-byte units and maps at 8-byte offsets, so transfers are widened to
//! aligned spans and the edge bytes patched from the buffer contents.

use crate::{ComputeDevice, DeviceBuffer, DeviceError, DeviceInfo, Result, WriteFence};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{debug, info};

const COPY_ALIGN: u64 = wgpu::COPY_BUFFER_ALIGNMENT;
const MAP_ALIGN: u64 = wgpu::MAP_ALIGNMENT;

struct GpuShared {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

/// One opened GPU with its context and in-order submission queue.
pub struct GpuDevice {
    shared: Arc<GpuShared>,
    name: String,
}

fn gpu_adapters(instance: &wgpu::Instance) -> Vec<wgpu::Adapter> {
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .filter(|adapter| adapter.get_info().device_type != wgpu::DeviceType::Cpu)
        .collect()
}

/// Enumerate usable GPUs in flattened-index order.
#[must_use]
pub fn list_devices() -> Vec<DeviceInfo> {
    let instance = wgpu::Instance::default();
    gpu_adapters(&instance)
        .iter()
        .enumerate()
        .map(|(index, adapter)| {
            let info = adapter.get_info();
            DeviceInfo {
                index,
                name: info.name,
                backend: info.backend.to_str().to_owned(),
                device_type: format!("{:?}", info.device_type),
            }
        })
        .collect()
}

impl GpuDevice {
    /// Open the GPU at `index` and create its device and queue.
    pub fn open(index: usize) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapters = gpu_adapters(&instance);
        if adapters.is_empty() {
            return Err(DeviceError::NoAdapter);
        }
        let count = adapters.len();
        let adapter = adapters
            .into_iter()
            .nth(index)
            .ok_or(DeviceError::BadIndex { index, count })?;
        let info = adapter.get_info();

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("vramfs"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        ))
        .map_err(|err| DeviceError::Request(err.to_string()))?;

        info!(
            target: "vramfs::device",
            name = %info.name,
            backend = info.backend.to_str(),
            "opened compute device"
        );

        Ok(Self {
            shared: Arc::new(GpuShared { device, queue }),
            name: info.name,
        })
    }
}

impl ComputeDevice for GpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_buffer(&self, len: u64) -> Result<Box<dyn DeviceBuffer>> {
        debug_assert_eq!(len % MAP_ALIGN, 0);
        let device = &self.shared.device;

        // wgpu reports allocation failure through error scopes, not the
        // creation call itself.
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vramfs block"),
            size: len,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            debug!(target: "vramfs::device", error = %err, "buffer allocation failed");
            return Err(DeviceError::OutOfMemory);
        }

        Ok(Box::new(GpuBuffer {
            shared: Arc::clone(&self.shared),
            buffer,
            len,
        }))
    }
}

struct GpuBuffer {
    shared: Arc<GpuShared>,
    buffer: wgpu::Buffer,
    len: u64,
}

impl GpuBuffer {
    fn check_bounds(&self, offset: u64, len: usize) -> Result<u64> {
        offset
            .checked_add(len as u64)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| DeviceError::Transfer("access past end of buffer".to_owned()))
    }

    /// Blocking read of an arbitrary byte range through a staging buffer.
    fn read_raw(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let end = self.check_bounds(offset, dst.len())?;

        // Widen to the map/copy granularity; the buffer length is aligned,
        // so the widened span always fits.
        let span_start = offset & !(MAP_ALIGN - 1);
        let span_end = end.next_multiple_of(COPY_ALIGN);
        let span = span_end - span_start;

        let staging = self.shared.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("vramfs staging"),
            size: span,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vramfs read"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, span_start, &staging, 0, span);
        self.shared.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.shared.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| DeviceError::Transfer("map callback dropped".to_owned()))?
            .map_err(|err| DeviceError::Transfer(err.to_string()))?;

        {
            let view = slice.get_mapped_range();
            let lead = (offset - span_start) as usize;
            dst.copy_from_slice(&view[lead..lead + dst.len()]);
        }
        staging.unmap();
        Ok(())
    }
}

impl DeviceBuffer for GpuBuffer {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.read_raw(offset, dst)
    }

    fn write_at(&mut self, offset: u64, src: &[u8]) -> Result<Box<dyn WriteFence>> {
        let end = self.check_bounds(offset, src.len())?;

        if offset % COPY_ALIGN == 0 && src.len() as u64 % COPY_ALIGN == 0 {
            if !src.is_empty() {
                self.shared.queue.write_buffer(&self.buffer, offset, src);
            }
        } else {
            // Widen to copy granularity, patching the edge bytes from the
            // current buffer contents. The in-order queue makes the patch
            // read consistent with every earlier write.
            let span_start = offset & !(COPY_ALIGN - 1);
            let span_end = end.next_multiple_of(COPY_ALIGN);
            let mut patch = vec![0_u8; (span_end - span_start) as usize];
            let lead = (offset - span_start) as usize;
            let tail = (end - span_start) as usize;
            if lead > 0 {
                self.read_raw(span_start, &mut patch[..lead])?;
            }
            if tail < patch.len() {
                self.read_raw(end, &mut patch[tail..])?;
            }
            patch[lead..tail].copy_from_slice(src);
            self.shared
                .queue
                .write_buffer(&self.buffer, span_start, &patch);
        }

        let done = Arc::new(AtomicBool::new(false));
        self.shared.queue.submit(std::iter::empty());
        let flag = Arc::clone(&done);
        self.shared.queue.on_submitted_work_done(move || {
            flag.store(true, Ordering::Release);
        });

        Ok(Box::new(GpuFence {
            shared: Arc::clone(&self.shared),
            done,
        }))
    }

    fn fill_zero(&mut self) -> Result<()> {
        let mut encoder = self
            .shared
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("vramfs clear"),
            });
        encoder.clear_buffer(&self.buffer, 0, None);
        self.shared.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

struct GpuFence {
    shared: Arc<GpuShared>,
    done: Arc<AtomicBool>,
}

impl WriteFence for GpuFence {
    fn wait(&self) -> Result<()> {
        while !self.done.load(Ordering::Acquire) {
            let _ = self.shared.device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }
}
