//! Just-in-time compilation of traced functions.
//!
//! `compile` wraps a function without running it. The first call traces it
//! into a graph, optimizes the graph and lowers it to a kernel; every call
//! then looks up the artifact for its guard (device and dtype) and builds
//! one if this guard has not been seen. Artifacts live as long as the
//! `CompiledFn`; GPU pipelines additionally stay cached on their device.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend;
use crate::codegen::{self, Kernel};
use crate::config::{Backend, CompileOptions};
use crate::error::Result;
use crate::gpu;
use crate::ir::{self, Graph, Traceable};
use crate::tensor::{DType, Device, Tensor};

/// Compile `f` with default options.
pub fn compile<F, A>(f: F) -> CompiledFn<F, A>
where
    F: Traceable<A>,
{
    compile_with(f, CompileOptions::default())
}

pub fn compile_with<F, A>(f: F, options: CompileOptions) -> CompiledFn<F, A>
where
    F: Traceable<A>,
{
    CompiledFn {
        f,
        options,
        traced: Mutex::new(None),
        artifacts: Mutex::new(HashMap::new()),
        counters: Counters::default(),
        _args: PhantomData,
    }
}

/// Key under which a compiled artifact is reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Guard {
    pub device: Device,
    pub dtype: DType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompileStats {
    pub calls: u64,
    pub traces: u64,
    pub compilations: u64,
    pub cache_hits: u64,
}

#[derive(Default)]
struct Counters {
    calls: AtomicU64,
    traces: AtomicU64,
    compilations: AtomicU64,
    cache_hits: AtomicU64,
}

/// Graphs and kernel derived from one trace. Device independent.
#[derive(Clone, Debug)]
pub struct Explanation {
    pub traced: Graph,
    /// `None` when optimization is disabled.
    pub optimized: Option<Graph>,
    pub kernel: Kernel,
}

impl Explanation {
    /// The graph that actually runs in fused mode.
    pub fn graph(&self) -> &Graph {
        self.optimized.as_ref().unwrap_or(&self.traced)
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "// traced ({} ops)", self.traced.op_count())?;
        writeln!(f, "{}", self.traced)?;
        if let Some(opt) = &self.optimized {
            writeln!(f, "// optimized ({} ops)", opt.op_count())?;
            writeln!(f, "{}", opt)?;
        }
        writeln!(
            f,
            "// {} (workgroup size {}, fingerprint {})",
            self.kernel.name, self.kernel.workgroup_size, self.kernel.fingerprint
        )?;
        write!(f, "{}", self.kernel.source)
    }
}

enum Artifact {
    /// Fused rayon interpreter over the optimized graph.
    Host(Graph),
    /// Fused kernel whose pipeline is already built on the device.
    Kernel(Kernel),
    /// The graph as traced, run one op at a time.
    Eager(Graph),
}

/// A function compiled lazily for each guard it is called with.
pub struct CompiledFn<F, A> {
    f: F,
    options: CompileOptions,
    traced: Mutex<Option<Arc<Explanation>>>,
    artifacts: Mutex<HashMap<Guard, Arc<Artifact>>>,
    counters: Counters,
    _args: PhantomData<fn() -> A>,
}

impl<F, A> CompiledFn<F, A>
where
    F: Traceable<A>,
{
    pub fn stats(&self) -> CompileStats {
        CompileStats {
            calls: self.counters.calls.load(Ordering::Relaxed),
            traces: self.counters.traces.load(Ordering::Relaxed),
            compilations: self.counters.compilations.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Trace and lower without touching any device.
    pub fn explain(&self) -> Result<Arc<Explanation>> {
        self.trace_once()
    }

    /// Run on `inputs`, compiling for their guard first if needed.
    pub fn call(&self, inputs: &[&Tensor]) -> Result<Tensor> {
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let (_, device) = backend::check_inputs(inputs, F::ARITY)?;
        let guard = Guard {
            device,
            dtype: inputs[0].dtype(),
        };
        let artifact = self.artifact(guard)?;
        match artifact.as_ref() {
            Artifact::Host(graph) => backend::run_cpu(graph, inputs, true),
            Artifact::Kernel(kernel) => backend::run_gpu_fused(kernel, inputs),
            Artifact::Eager(graph) => match device {
                Device::Cpu => backend::run_cpu(graph, inputs, false),
                Device::Gpu(_) => {
                    backend::run_gpu_unfused(graph, inputs, self.options.workgroup_size)
                }
            },
        }
    }

    fn trace_once(&self) -> Result<Arc<Explanation>> {
        let mut slot = self.traced.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(explanation) = slot.as_ref() {
            return Ok(Arc::clone(explanation));
        }

        let traced = ir::trace::<F, A>(&self.f)?;
        self.counters.traces.fetch_add(1, Ordering::Relaxed);
        let optimized = self.options.optimize.then(|| ir::optimize(&traced));
        let kernel = codegen::lower(
            optimized.as_ref().unwrap_or(&traced),
            self.options.workgroup_size,
        );
        tracing::debug!(
            kernel = %kernel.name,
            fingerprint = %kernel.fingerprint,
            traced_ops = traced.op_count(),
            optimized_ops = optimized.as_ref().map(|g| g.op_count()),
            "traced function"
        );

        let explanation = Arc::new(Explanation {
            traced,
            optimized,
            kernel,
        });
        if let Some(dir) = &self.options.dump_dir {
            dump(dir, &explanation)?;
        }
        *slot = Some(Arc::clone(&explanation));
        Ok(explanation)
    }

    fn artifact(&self, guard: Guard) -> Result<Arc<Artifact>> {
        let explanation = self.trace_once()?;
        let mut artifacts = self.artifacts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(artifact) = artifacts.get(&guard) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(device = %guard.device, "compiled artifact cache hit");
            return Ok(Arc::clone(artifact));
        }

        let artifact = match (self.options.backend, guard.device) {
            (Backend::Fused, Device::Cpu) => Artifact::Host(explanation.graph().clone()),
            (Backend::Fused, Device::Gpu(ordinal)) => {
                let ctx = gpu::context(ordinal)?;
                ctx.pipeline(&explanation.kernel)?;
                Artifact::Kernel(explanation.kernel.clone())
            }
            (Backend::Eager, device) => {
                if device == Device::Cpu {
                    tracing::debug!("eager backend on cpu runs the unfused interpreter");
                }
                Artifact::Eager(explanation.traced.clone())
            }
        };
        self.counters.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            device = %guard.device,
            dtype = %guard.dtype,
            backend = ?self.options.backend,
            kernel = %explanation.kernel.name,
            "compiled"
        );

        let artifact = Arc::new(artifact);
        artifacts.insert(guard, Arc::clone(&artifact));
        Ok(artifact)
    }
}

impl<F, A> fmt::Debug for CompiledFn<F, A>
where
    F: Traceable<A>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFn")
            .field("arity", &F::ARITY)
            .field("options", &self.options)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Write `<kernel>.wgsl` and `<kernel>.ir` into `dir`.
fn dump(dir: &Path, explanation: &Explanation) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let name = &explanation.kernel.name;
    std::fs::write(
        dir.join(format!("{}.wgsl", name)),
        &explanation.kernel.source,
    )?;
    let mut ir = explanation.traced.to_string();
    if let Some(opt) = &explanation.optimized {
        ir.push_str("\n\n");
        ir.push_str(&opt.to_string());
    }
    ir.push('\n');
    std::fs::write(dir.join(format!("{}.ir", name)), ir)?;
    tracing::debug!(dir = %dir.display(), kernel = %name, "dumped kernel");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Traced;

    fn cube(x: &Traced) -> Traced {
        x * x * x
    }

    #[test]
    fn test_compiled_fn_is_send_and_sync() {
        fn check<T: Send + Sync>(_: &T) {}
        check(&compile(cube));
    }

    #[test]
    fn test_explain_traces_once_without_a_device() {
        let f = compile(cube);
        let a = f.explain().unwrap();
        let b = f.explain().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.stats().traces, 1);
        assert_eq!(f.stats().compilations, 0);
        assert_eq!(a.traced.op_count(), 2);
        assert!(a.kernel.source.contains("@compute"));
    }

    #[test]
    fn test_explanation_lists_graphs_and_kernel() {
        let text = compile(cube).explain().unwrap().to_string();
        assert!(text.starts_with("// traced (2 ops)\ngraph(in0) {"));
        assert!(text.contains("// optimized"));
        assert!(text.contains("// kernel_"));
        assert!(text.contains("fn main("));

        let options = CompileOptions {
            optimize: false,
            ..CompileOptions::default()
        };
        let text = compile_with(cube, options).explain().unwrap().to_string();
        assert!(!text.contains("// optimized"));
    }

    #[test]
    fn test_compile_options_leave_adapter_selection_alone() {
        let options = CompileOptions {
            allow_software_adapter: true,
            ..CompileOptions::default()
        };
        let f = compile_with(cube, options);
        f.explain().unwrap();
        assert!(!gpu::software_adapters_allowed());
    }

    #[test]
    fn test_dump_dir_receives_kernel_and_ir() {
        let dir = tempfile::tempdir().unwrap();
        let options = CompileOptions {
            dump_dir: Some(dir.path().join("kernels")),
            ..CompileOptions::default()
        };
        let f = compile_with(cube, options);
        let name = f.explain().unwrap().kernel.name.clone();
        let wgsl = std::fs::read_to_string(dir.path().join("kernels").join(format!("{}.wgsl", name)))
            .unwrap();
        assert!(wgsl.starts_with(&format!("// {}", name)));
        let ir = std::fs::read_to_string(dir.path().join("kernels").join(format!("{}.ir", name)))
            .unwrap();
        assert!(ir.contains("graph(in0)"));
    }
}
