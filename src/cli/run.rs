use std::path::PathBuf;

use clap::Args;

use kiln::{compile_with, manual_seed, square_fn, Backend, CompileOptions, Device, Shape, Tensor};

use super::{fail, load_options};

#[derive(Args)]
pub struct RunArgs {
    /// Device for the input tensor (cpu, gpu, gpu:N)
    #[arg(long, default_value = "gpu")]
    pub device: Device,
    /// Input shape, e.g. 4,4 or 4x4
    #[arg(long, default_value = "4,4")]
    pub shape: Shape,
    /// Seed for the random input
    #[arg(long)]
    pub seed: Option<u64>,
    /// Execution backend (fused or eager); overrides kiln.toml
    #[arg(long)]
    pub backend: Option<Backend>,
    /// Path to a kiln.toml (default: search upward from the working directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Write generated kernels and their IR to this directory
    #[arg(long)]
    pub dump_dir: Option<PathBuf>,
    /// Also run the eager path and report the largest difference
    #[arg(long)]
    pub check: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        RunArgs {
            device: Device::Gpu(0),
            shape: Shape::from([4, 4]),
            seed: None,
            backend: None,
            config: None,
            dump_dir: None,
            check: false,
        }
    }
}

fn options(args: &RunArgs) -> CompileOptions {
    let mut options = load_options(args.config.as_deref());
    if let Some(backend) = args.backend {
        options.backend = backend;
    }
    if let Some(dir) = &args.dump_dir {
        options.dump_dir = Some(dir.clone());
    }
    if let Err(msg) = options.validate() {
        fail(msg);
    }
    if options.allow_software_adapter {
        kiln::gpu::allow_software_adapters(true);
    }
    options
}

pub fn cmd_run(args: RunArgs) {
    let options = options(&args);
    if let Some(seed) = args.seed {
        manual_seed(seed);
    }

    let compiled = compile_with(square_fn, options);
    let x = Tensor::randn(args.shape.clone(), args.device).unwrap_or_else(|e| fail(e));
    let y = compiled.call(&[&x]).unwrap_or_else(|e| fail(e));
    let text = y.render().unwrap_or_else(|e| fail(e));
    println!("{}", text);

    if args.check {
        let expected = x.square().unwrap_or_else(|e| fail(e));
        let err = y.max_abs_diff(&expected).unwrap_or_else(|e| fail(e));
        eprintln!("check: max abs error vs eager = {:e}", err);
        if !y.allclose(&expected, 1e-5, 1e-6).unwrap_or_else(|e| fail(e)) {
            fail(format!(
                "compiled result differs from eager result (max abs error {:e})",
                err
            ));
        }
    }

    let stats = compiled.stats();
    tracing::debug!(
        calls = stats.calls,
        traces = stats.traces,
        compilations = stats.compilations,
        cache_hits = stats.cache_hits,
        "done"
    );
}
