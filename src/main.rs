mod cli;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{devices, explain, run};

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "Compile an elementwise square and run it on the GPU"
)]
struct Cli {
    /// Log compile and device events (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Square a random tensor with a compiled function and print it (default)
    Run(run::RunArgs),
    /// Print the traced graph, the optimized graph and the generated WGSL
    Explain(explain::ExplainArgs),
    /// List GPU adapters and the ordinals kiln assigns them
    Devices,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "kiln=debug" } else { "kiln=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        None => run::cmd_run(run::RunArgs::default()),
        Some(Command::Run(args)) => run::cmd_run(args),
        Some(Command::Explain(args)) => explain::cmd_explain(args),
        Some(Command::Devices) => devices::cmd_devices(),
    }
}
