use std::path::PathBuf;

use thiserror::Error;

use crate::tensor::{Device, Shape};

pub type Result<T> = std::result::Result<T, KilnError>;

/// Everything that can go wrong between tracing a function and reading
/// its result back.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error("no compatible GPU adapter for {device}: {reason}")]
    NoAdapter { device: Device, reason: String },

    #[error("failed to open {device}: {message}")]
    DeviceRequest { device: Device, message: String },

    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    #[error("data length {len} does not match shape {shape} ({numel} elements)")]
    DataLength {
        len: usize,
        shape: Shape,
        numel: usize,
    },

    #[error("shape {shape} has more elements than can be stored")]
    ShapeOverflow { shape: Shape },

    #[error("device mismatch: expected all inputs on {expected}, got {actual}")]
    DeviceMismatch { expected: Device, actual: Device },

    #[error("expected {expected} input tensor(s), got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("trace failed: {0}")]
    Trace(String),

    #[error("{device} cannot hold a {bytes}-byte buffer (binding limit {limit} bytes)")]
    BufferTooLarge { device: Device, bytes: u64, limit: u64 },

    #[error("{device} reported an error: {message}")]
    Gpu { device: Device, message: String },

    #[error("kernel {name} failed validation: {message}")]
    KernelValidation { name: String, message: String },

    #[error("GPU readback failed: {0}")]
    Readback(String),

    #[error("{}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl KilnError {
    pub fn trace(message: impl Into<String>) -> Self {
        KilnError::Trace(message.into())
    }

    pub fn config(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        KilnError::Config {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the failure means "this machine has no usable GPU".
    pub fn is_no_adapter(&self) -> bool {
        matches!(self, KilnError::NoAdapter { .. })
    }
}
