use std::fmt;
use std::sync::{mpsc, Arc};

use wgpu::util::DeviceExt;

use super::GpuContext;
use crate::error::{KilnError, Result};
use crate::tensor::Device;

/// An `f32` storage buffer on one device.
pub struct GpuBuffer {
    ctx: Arc<GpuContext>,
    buffer: wgpu::Buffer,
    len: usize,
}

const USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl GpuBuffer {
    pub fn upload(ctx: &Arc<GpuContext>, data: &[f32]) -> Result<GpuBuffer> {
        checked_size(ctx, data.len())?;
        // Zero-sized bindings are invalid; empty tensors get one padding word.
        let contents: &[u8] = if data.is_empty() {
            &[0u8; 4]
        } else {
            bytemuck::cast_slice(data)
        };
        let buffer = ctx.scoped("upload", |device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kiln tensor"),
                contents,
                usage: USAGE,
            })
        })?;
        Ok(GpuBuffer {
            ctx: Arc::clone(ctx),
            buffer,
            len: data.len(),
        })
    }

    /// Uninitialized output buffer of `len` elements.
    pub(crate) fn uninit(ctx: &Arc<GpuContext>, len: usize) -> Result<GpuBuffer> {
        let size = checked_size(ctx, len)?;
        let buffer = ctx.scoped("allocate", |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kiln output"),
                size,
                usage: USAGE,
                mapped_at_creation: false,
            })
        })?;
        Ok(GpuBuffer {
            ctx: Arc::clone(ctx),
            buffer,
            len,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Copy the contents back to the host. Blocks until all submitted work
    /// that writes this buffer has finished.
    pub fn read(&self) -> Result<Vec<f32>> {
        if self.len == 0 {
            return Ok(Vec::new());
        }
        let size = checked_size(&self.ctx, self.len)?;
        let staging = self.ctx.scoped("readback", |device| {
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("kiln readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kiln readback"),
            });
            encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging, 0, size);
            self.ctx.queue().submit(Some(encoder.finish()));
            staging
        })?;

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        let _ = self.ctx.device().poll(wgpu::Maintain::Wait);
        self.ctx.check_healthy()?;

        rx.recv()
            .map_err(|_| KilnError::Readback("map callback was dropped".to_string()))?
            .map_err(|e| KilnError::Readback(e.to_string()))?;

        let data = {
            let view = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&view)[..self.len].to_vec()
        };
        staging.unmap();
        Ok(data)
    }
}

/// Largest storage binding, in bytes, a device with `limits` accepts.
pub(super) fn max_binding_bytes(limits: &wgpu::Limits) -> u64 {
    limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size))
}

/// Byte size of a buffer of `len` elements, if it can be bound whole.
fn byte_size(len: usize, limits: &wgpu::Limits) -> Option<u64> {
    let bytes = u64::try_from(len.max(1))
        .ok()?
        .checked_mul(std::mem::size_of::<f32>() as u64)?;
    (bytes <= max_binding_bytes(limits)).then_some(bytes)
}

fn checked_size(ctx: &GpuContext, len: usize) -> Result<u64> {
    let limits = ctx.device().limits();
    byte_size(len, &limits).ok_or_else(|| KilnError::BufferTooLarge {
        device: Device::Gpu(ctx.ordinal()),
        bytes: (len as u64).saturating_mul(std::mem::size_of::<f32>() as u64),
        limit: max_binding_bytes(&limits),
    })
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("device", &self.ctx.ordinal())
            .field("len", &self.len)
            .finish()
    }
}
