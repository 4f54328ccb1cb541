pub mod devices;
pub mod explain;
pub mod run;

use std::fmt::Display;
use std::path::Path;
use std::process;

use kiln::CompileOptions;

/// Print `error: <e>` and exit 1.
pub fn fail(e: impl Display) -> ! {
    eprintln!("error: {}", e);
    process::exit(1);
}

/// Compile options from `--config`, else from the nearest kiln.toml, else
/// the defaults.
pub fn load_options(config: Option<&Path>) -> CompileOptions {
    let path = match config {
        Some(p) => Some(p.to_path_buf()),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| CompileOptions::find(&cwd)),
    };
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading compile options");
            CompileOptions::load(&path).unwrap_or_else(|e| fail(e))
        }
        None => CompileOptions::default(),
    }
}
