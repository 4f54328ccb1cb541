//! Dense `f32` tensors with device placement.
//!
//! A tensor is immutable once created. Host tensors share an `Arc<[f32]>`,
//! GPU tensors share a storage buffer on their device context; cloning a
//! tensor never copies data.

mod format;
pub mod random;


use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::backend;
use crate::error::{KilnError, Result};
use crate::gpu::{self, GpuBuffer};
use crate::ir::{BinaryOp, UnaryOp};

pub use random::{manual_seed, Generator};

// ─── Shape ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total element count. A rank-0 shape holds one element.
    ///
    /// Saturates at `usize::MAX`; tensors only exist for shapes whose
    /// `checked_numel` succeeds.
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// Element count, or `None` if it overflows `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape(dims.to_vec())
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl FromStr for Shape {
    type Err = String;

    /// Parse `4,4` or `4x4`.
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty shape".to_string());
        }
        s.split([',', 'x'])
            .map(|d| {
                d.trim()
                    .parse::<usize>()
                    .map_err(|_| format!("invalid dimension '{}' in shape '{}'", d.trim(), s))
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Shape)
            .and_then(|shape| match shape.checked_numel() {
                Some(_) => Ok(shape),
                None => Err(format!("shape '{}' has too many elements", s)),
            })
    }
}

// ─── DType / Device ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum DType {
    #[default]
    F32,
}

impl DType {
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Cpu,
    /// GPU adapter by ordinal, in the order `gpu::list_adapters` reports
    /// usable adapters.
    Gpu(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(n) => write!(f, "gpu:{}", n),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    /// Accepts `cpu`, `gpu`, `gpu:N`; `cuda` is an alias for `gpu`.
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => return Ok(Device::Cpu),
            "gpu" | "cuda" => return Ok(Device::Gpu(0)),
            _ => {}
        }
        let ordinal = s
            .strip_prefix("gpu:")
            .or_else(|| s.strip_prefix("cuda:"))
            .ok_or_else(|| format!("unknown device '{}' (expected cpu, gpu or gpu:N)", s))?;
        ordinal
            .parse::<usize>()
            .map(Device::Gpu)
            .map_err(|_| format!("invalid device ordinal in '{}'", s))
    }
}

// ─── Tensor ────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum Storage {
    Host(Arc<[f32]>),
    Gpu(Arc<GpuBuffer>),
}

#[derive(Clone)]
pub struct Tensor {
    shape: Shape,
    storage: Storage,
}

impl Tensor {
    /// Host tensor from row-major data.
    pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Tensor> {
        let shape = shape.into();
        check_len(&shape, data.len())?;
        Ok(Tensor {
            shape,
            storage: Storage::Host(data.into()),
        })
    }

    /// Tensor from row-major data, placed on `device`.
    pub fn from_slice(shape: impl Into<Shape>, data: &[f32], device: Device) -> Result<Tensor> {
        let shape = shape.into();
        check_len(&shape, data.len())?;
        let storage = match device {
            Device::Cpu => Storage::Host(data.into()),
            Device::Gpu(ordinal) => {
                let ctx = gpu::context(ordinal)?;
                Storage::Gpu(Arc::new(GpuBuffer::upload(&ctx, data)?))
            }
        };
        Ok(Tensor { shape, storage })
    }

    pub fn full(shape: impl Into<Shape>, value: f32, device: Device) -> Result<Tensor> {
        let shape = shape.into();
        let data = vec![value; storage_len(&shape)?];
        Tensor::from_slice(shape, &data, device)
    }

    pub fn zeros(shape: impl Into<Shape>, device: Device) -> Result<Tensor> {
        Tensor::full(shape, 0.0, device)
    }

    /// Standard-normal samples from the thread's default generator.
    pub fn randn(shape: impl Into<Shape>, device: Device) -> Result<Tensor> {
        let shape = shape.into();
        random::with_default(|g| g.randn(shape, device))
    }

    pub(crate) fn from_storage(shape: Shape, storage: Storage) -> Tensor {
        Tensor { shape, storage }
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        DType::F32
    }

    pub fn device(&self) -> Device {
        match &self.storage {
            Storage::Host(_) => Device::Cpu,
            Storage::Gpu(buf) => Device::Gpu(buf.context().ordinal()),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Copy to `device`. Returns a cheap clone when already there.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        if self.device() == device {
            return Ok(self.clone());
        }
        let data = self.to_vec()?;
        Tensor::from_slice(self.shape.clone(), &data, device)
    }

    /// Row-major contents, read back from the device if needed.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        match &self.storage {
            Storage::Host(data) => Ok(data.to_vec()),
            Storage::Gpu(buf) => buf.read(),
        }
    }

    /// Eager elementwise square, one kernel launch on GPU tensors.
    pub fn square(&self) -> Result<Tensor> {
        backend::eager_unary(UnaryOp::Square, self)
    }

    /// Eager elementwise product.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        backend::eager_binary(BinaryOp::Mul, self, other)
    }

    /// Largest absolute elementwise difference.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        self.check_same_shape(other)?;
        let (a, b) = (self.to_vec()?, other.to_vec()?);
        Ok(a.iter()
            .zip(&b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, |m, d| {
                if m.is_nan() || d.is_nan() {
                    f32::NAN
                } else {
                    m.max(d)
                }
            }))
    }

    /// `|a - b| <= atol + rtol * |b|` for every element. NaN never matches.
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> Result<bool> {
        self.check_same_shape(other)?;
        let (a, b) = (self.to_vec()?, other.to_vec()?);
        Ok(a.iter().zip(&b).all(|(x, y)| {
            if x.is_infinite() || y.is_infinite() {
                return x == y;
            }
            (x - y).abs() <= atol + rtol * y.abs()
        }))
    }

    fn check_same_shape(&self, other: &Tensor) -> Result<()> {
        if self.shape != other.shape {
            return Err(KilnError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Text form: `tensor([...], device='gpu:0')`.
    pub fn render(&self) -> Result<String> {
        let data = self.to_vec()?;
        Ok(format::render(&self.shape, &data, self.device()))
    }
}

/// Element count of `shape`, if its data fits in one host allocation.
pub(crate) fn storage_len(shape: &Shape) -> Result<usize> {
    let max = isize::MAX as usize / DType::F32.size_bytes();
    shape
        .checked_numel()
        .filter(|&n| n <= max)
        .ok_or_else(|| KilnError::ShapeOverflow {
            shape: shape.clone(),
        })
}

fn check_len(shape: &Shape, len: usize) -> Result<()> {
    let numel = storage_len(shape)?;
    if numel != len {
        return Err(KilnError::DataLength {
            len,
            shape: shape.clone(),
            numel,
        });
    }
    Ok(())
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(text) => f.write_str(&text),
            Err(e) => write!(f, "tensor(<unavailable: {}>)", e),
        }
    }
}
