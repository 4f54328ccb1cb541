//! Graph execution on host and GPU tensors.
//!
//! Every entry point checks that all inputs agree on shape and device
//! before any work is scheduled. Outputs always take the shape and device
//! of the inputs.

mod cpu;
mod gpu;

use std::sync::Arc;

use crate::codegen::{self, Kernel};
use crate::error::{KilnError, Result};
use crate::gpu as runtime;
use crate::ir::{BinaryOp, Graph, Node, NodeId, UnaryOp};
use crate::tensor::{Device, Shape, Storage, Tensor};

/// Workgroup size for the one-op kernels behind eager tensor methods.
const EAGER_WORKGROUP_SIZE: u32 = 64;

/// Shape and device shared by all `inputs`.
pub(crate) fn check_inputs(inputs: &[&Tensor], arity: usize) -> Result<(Shape, Device)> {
    if inputs.len() != arity {
        return Err(KilnError::Arity {
            expected: arity,
            actual: inputs.len(),
        });
    }
    let Some(first) = inputs.first() else {
        return Err(KilnError::Arity {
            expected: arity.max(1),
            actual: 0,
        });
    };
    let (shape, device) = (first.shape().clone(), first.device());
    for t in &inputs[1..] {
        if t.device() != device {
            return Err(KilnError::DeviceMismatch {
                expected: device,
                actual: t.device(),
            });
        }
        if t.shape() != &shape {
            return Err(KilnError::ShapeMismatch {
                expected: shape,
                actual: t.shape().clone(),
            });
        }
    }
    Ok((shape, device))
}

fn host_slices<'a>(inputs: &[&'a Tensor]) -> Result<Vec<&'a [f32]>> {
    inputs
        .iter()
        .map(|t| match t.storage() {
            Storage::Host(data) => Ok(&data[..]),
            Storage::Gpu(_) => Err(KilnError::DeviceMismatch {
                expected: Device::Cpu,
                actual: t.device(),
            }),
        })
        .collect()
}

fn gpu_buffers(inputs: &[&Tensor]) -> Result<Vec<Arc<runtime::GpuBuffer>>> {
    inputs
        .iter()
        .map(|t| match t.storage() {
            Storage::Gpu(buf) => Ok(Arc::clone(buf)),
            Storage::Host(_) => Err(KilnError::DeviceMismatch {
                expected: Device::Gpu(0),
                actual: Device::Cpu,
            }),
        })
        .collect()
}

// ─── Compiled execution ────────────────────────────────────────────

/// Run `graph` on host tensors, fused (one pass per element) or op by op.
pub(crate) fn run_cpu(graph: &Graph, inputs: &[&Tensor], fused: bool) -> Result<Tensor> {
    let (shape, _) = check_inputs(inputs, graph.inputs())?;
    let slices = host_slices(inputs)?;
    let len = shape.numel();
    let data = if fused {
        cpu::fused(graph, &slices, len)
    } else {
        cpu::unfused(graph, &slices, len)
    };
    Ok(Tensor::from_storage(shape, Storage::Host(data.into())))
}

/// Run a fused kernel on GPU tensors.
pub(crate) fn run_gpu_fused(kernel: &Kernel, inputs: &[&Tensor]) -> Result<Tensor> {
    let (shape, device) = check_inputs(inputs, kernel.inputs)?;
    let ctx = context_for(device)?;
    let buffers = gpu_buffers(inputs)?;
    let refs: Vec<&runtime::GpuBuffer> = buffers.iter().map(|b| b.as_ref()).collect();
    let out = gpu::fused(&ctx, kernel, &refs, shape.numel())?;
    Ok(Tensor::from_storage(shape, Storage::Gpu(Arc::new(out))))
}

/// Run `graph` on GPU tensors with one kernel per operation.
pub(crate) fn run_gpu_unfused(
    graph: &Graph,
    inputs: &[&Tensor],
    workgroup_size: u32,
) -> Result<Tensor> {
    let (shape, device) = check_inputs(inputs, graph.inputs())?;
    let ctx = context_for(device)?;
    let buffers = gpu_buffers(inputs)?;
    let out = gpu::unfused(&ctx, graph, &buffers, shape.numel(), workgroup_size)?;
    Ok(Tensor::from_storage(shape, Storage::Gpu(out)))
}

fn context_for(device: Device) -> Result<Arc<runtime::GpuContext>> {
    match device {
        Device::Gpu(ordinal) => runtime::context(ordinal),
        Device::Cpu => Err(KilnError::DeviceMismatch {
            expected: Device::Gpu(0),
            actual: Device::Cpu,
        }),
    }
}

// ─── Eager tensor ops ──────────────────────────────────────────────

fn run_eager(graph: &Graph, inputs: &[&Tensor]) -> Result<Tensor> {
    let (_, device) = check_inputs(inputs, graph.inputs())?;
    match device {
        Device::Cpu => run_cpu(graph, inputs, true),
        Device::Gpu(_) => {
            let kernel = codegen::lower(graph, EAGER_WORKGROUP_SIZE);
            run_gpu_fused(&kernel, inputs)
        }
    }
}

/// Apply one unary op elementwise.
pub(crate) fn eager_unary(op: UnaryOp, x: &Tensor) -> Result<Tensor> {
    let graph = Graph::new(vec![Node::Input(0), Node::Unary(op, NodeId(0))], 1, NodeId(1))?;
    run_eager(&graph, &[x])
}

/// Apply one binary op elementwise. Shapes must match exactly.
pub(crate) fn eager_binary(op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let graph = Graph::new(
        vec![
            Node::Input(0),
            Node::Input(1),
            Node::Binary(op, NodeId(0), NodeId(1)),
        ],
        2,
        NodeId(2),
    )?;
    run_eager(&graph, &[a, b])
}
