//! kiln: a small tracing JIT for elementwise tensor functions.
//!
//! Write a function over [`Traced`] values, wrap it with [`compile`], and
//! call it on [`Tensor`]s. The first call traces the function into a graph,
//! optimizes it and lowers it to one fused WGSL kernel that runs through
//! wgpu; host tensors run the same graph on a rayon interpreter.
//!
//! ```no_run
//! use kiln::{compile, square_fn, Device, Tensor};
//!
//! let compiled = compile(square_fn);
//! let x = Tensor::randn([4, 4], Device::Gpu(0))?;
//! println!("{}", compiled.call(&[&x])?);
//! # Ok::<(), kiln::KilnError>(())
//! ```

mod backend;
pub mod codegen;
pub mod compile;
pub mod config;
pub mod error;
pub mod gpu;
pub mod ir;
pub mod tensor;

pub use compile::{compile, compile_with, CompileStats, CompiledFn, Explanation, Guard};
pub use config::{Backend, CompileOptions};
pub use error::{KilnError, Result};
pub use ir::{Graph, Traced};
pub use tensor::{manual_seed, DType, Device, Generator, Shape, Tensor};

/// `x` squared elementwise.
pub fn square_fn(x: &Traced) -> Traced {
    x.square()
}
