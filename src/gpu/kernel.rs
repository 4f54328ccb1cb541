use std::sync::Arc;

use super::{GpuBuffer, GpuContext};
use crate::codegen::Kernel;
use crate::error::{KilnError, Result};

/// A built compute pipeline and its bind group layout.
pub(crate) struct KernelPipeline {
    name: String,
    inputs: usize,
    workgroup_size: u32,
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl KernelPipeline {
    fn build(ctx: &GpuContext, kernel: &Kernel) -> Result<KernelPipeline> {
        let device = ctx.device();
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&kernel.name),
            source: wgpu::ShaderSource::Wgsl(kernel.source.as_str().into()),
        });

        // Explicit layout: an input the graph never reads still owns a binding.
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = (0..kernel.inputs as u32)
            .map(|b| storage_entry(b, true))
            .collect();
        entries.push(storage_entry(kernel.inputs as u32, false));
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&kernel.name),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&kernel.name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&kernel.name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(KilnError::KernelValidation {
                name: kernel.name.clone(),
                message: err.to_string(),
            });
        }

        Ok(KernelPipeline {
            name: kernel.name.clone(),
            inputs: kernel.inputs,
            workgroup_size: kernel.workgroup_size,
            layout,
            pipeline,
        })
    }
}

impl GpuContext {
    /// The pipeline for `kernel`, built on first request.
    pub(crate) fn pipeline(&self, kernel: &Kernel) -> Result<Arc<KernelPipeline>> {
        let mut cache = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = cache.get(&kernel.fingerprint) {
            tracing::trace!(kernel = %kernel.name, "pipeline cache hit");
            return Ok(Arc::clone(p));
        }
        self.check_healthy()?;
        let pipeline = Arc::new(KernelPipeline::build(self, kernel)?);
        tracing::debug!(kernel = %kernel.name, device = self.ordinal, "built pipeline");
        cache.insert(kernel.fingerprint.clone(), Arc::clone(&pipeline));
        Ok(pipeline)
    }
}

/// Workgroup grid covering `len` elements. Spills into `y` once `x` hits the
/// per-dimension limit; the shader flattens both back into one index.
fn grid(len: usize, workgroup_size: u32, max_per_dim: u32) -> (u32, u32) {
    let groups = len.div_ceil(workgroup_size as usize).max(1);
    let max = max_per_dim.max(1) as usize;
    if groups <= max {
        (groups as u32, 1)
    } else {
        (max as u32, groups.div_ceil(max) as u32)
    }
}

/// Run `kernel` over `len` elements of `inputs` into a fresh buffer.
pub fn dispatch(
    ctx: &Arc<GpuContext>,
    kernel: &Kernel,
    inputs: &[&GpuBuffer],
    len: usize,
) -> Result<GpuBuffer> {
    if inputs.len() != kernel.inputs {
        return Err(KilnError::Arity {
            expected: kernel.inputs,
            actual: inputs.len(),
        });
    }
    for buf in inputs {
        if !Arc::ptr_eq(buf.context(), ctx) {
            return Err(KilnError::DeviceMismatch {
                expected: crate::tensor::Device::Gpu(ctx.ordinal()),
                actual: crate::tensor::Device::Gpu(buf.context().ordinal()),
            });
        }
        if buf.len() != len {
            return Err(KilnError::trace(format!(
                "kernel {} input holds {} elements, expected {}",
                kernel.name,
                buf.len(),
                len
            )));
        }
    }

    let out = GpuBuffer::uninit(ctx, len)?;
    if len == 0 {
        return Ok(out);
    }

    let pipeline = ctx.pipeline(kernel)?;
    let (x, y) = grid(
        len,
        pipeline.workgroup_size,
        ctx.device().limits().max_compute_workgroups_per_dimension,
    );
    ctx.scoped(&pipeline.name, |device| {
        let mut entries: Vec<wgpu::BindGroupEntry> = inputs
            .iter()
            .enumerate()
            .map(|(k, buf)| wgpu::BindGroupEntry {
                binding: k as u32,
                resource: buf.raw().as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: pipeline.inputs as u32,
            resource: out.raw().as_entire_binding(),
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(&pipeline.name),
            layout: &pipeline.layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&pipeline.name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&pipeline.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        ctx.queue().submit(Some(encoder.finish()));
    })?;
    Ok(out)
}
