use std::path::PathBuf;

use clap::Args;

use kiln::{compile_with, square_fn};

use super::{fail, load_options};

#[derive(Args)]
pub struct ExplainArgs {
    /// Show the graph exactly as traced
    #[arg(long)]
    pub no_optimize: bool,
    /// Workgroup size of the generated kernel
    #[arg(long)]
    pub workgroup_size: Option<u32>,
    /// Path to a kiln.toml (default: search upward from the working directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn cmd_explain(args: ExplainArgs) {
    let mut options = load_options(args.config.as_deref());
    if args.no_optimize {
        options.optimize = false;
    }
    if let Some(wg) = args.workgroup_size {
        options.workgroup_size = wg;
    }
    if let Err(msg) = options.validate() {
        fail(msg);
    }

    let compiled = compile_with(square_fn, options);
    let explanation = compiled.explain().unwrap_or_else(|e| fail(e));
    println!("{}", explanation);
}
