use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{KilnError, Result};

pub const CONFIG_FILE: &str = "kiln.toml";

/// How a compiled function executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Backend {
    /// One kernel (or one interpreter pass) for the whole graph.
    #[default]
    Fused,
    /// One kernel per operation of the traced graph.
    Eager,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Fused => write!(f, "fused"),
            Backend::Eager => write!(f, "eager"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fused" => Ok(Backend::Fused),
            "eager" => Ok(Backend::Eager),
            other => Err(format!("unknown backend '{}' (expected fused or eager)", other)),
        }
    }
}

/// Options for `compile_with`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    pub backend: Backend,
    /// Run graph rewrites before lowering.
    pub optimize: bool,
    /// Invocations per workgroup. Power of two, at most 256.
    pub workgroup_size: u32,
    /// Write generated kernels and their IR here.
    pub dump_dir: Option<PathBuf>,
    /// Let software adapters back `gpu:N`. Adapter selection is process
    /// wide, so `compile_with` ignores this; the `kiln` binary applies it
    /// with `gpu::allow_software_adapters`.
    pub allow_software_adapter: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            backend: Backend::Fused,
            optimize: true,
            workgroup_size: 64,
            dump_dir: None,
            allow_software_adapter: false,
        }
    }
}

impl CompileOptions {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let wg = self.workgroup_size;
        if wg == 0 || wg > 256 || !wg.is_power_of_two() {
            return Err(format!(
                "workgroup_size must be a power of two between 1 and 256, got {}",
                wg
            ));
        }
        Ok(())
    }

    /// Load options from a kiln.toml file.
    ///
    /// Keys live under `[compile]` (or at the top level). A relative
    /// `dump_dir` is resolved against the file's directory.
    pub fn load(toml_path: &Path) -> Result<CompileOptions> {
        let content = std::fs::read_to_string(toml_path)
            .map_err(|e| KilnError::config(toml_path, format!("cannot read: {}", e)))?;
        let root_dir = toml_path.parent().unwrap_or(Path::new("."));

        let mut options = CompileOptions::default();
        let mut section = String::new();

        // Minimal TOML parsing: `key = value` lines, `[section]` headers.
        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                section = name.trim().to_string();
                continue;
            }
            if !(section.is_empty() || section == "compile") {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(KilnError::config(
                    toml_path,
                    format!("line {}: expected `key = value`", lineno + 1),
                ));
            };
            let key = key.trim().trim_matches('"');
            let value = strip_comment(value).trim().trim_matches('"');
            let bad = |msg: String| {
                KilnError::config(toml_path, format!("line {}: {}", lineno + 1, msg))
            };
            match key {
                "backend" => options.backend = value.parse::<Backend>().map_err(bad)?,
                "optimize" => options.optimize = parse_bool(key, value).map_err(bad)?,
                "workgroup_size" => {
                    options.workgroup_size = value
                        .parse()
                        .map_err(|_| bad(format!("invalid workgroup_size '{}'", value)))?
                }
                "dump_dir" => options.dump_dir = Some(root_dir.join(value)),
                "allow_software_adapter" => {
                    options.allow_software_adapter = parse_bool(key, value).map_err(bad)?
                }
                _ => tracing::warn!(file = %toml_path.display(), key, "ignoring unknown key"),
            }
        }

        options
            .validate()
            .map_err(|msg| KilnError::config(toml_path, msg))?;
        Ok(options)
    }

    /// Try to find a kiln.toml in the given directory or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

fn strip_comment(value: &str) -> &str {
    let value = value.trim();
    if let Some(rest) = value.strip_prefix('"') {
        return match rest.find('"') {
            Some(end) => &value[..end + 2],
            None => value,
        };
    }
    value.split('#').next().unwrap_or(value)
}

fn parse_bool(key: &str, value: &str) -> std::result::Result<bool, String> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{} must be true or false, got '{}'", key, value)),
    }
}
