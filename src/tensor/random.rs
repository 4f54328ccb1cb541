//! Random tensor generation.
//!
//! Each thread owns a default generator seeded from OS entropy on first
//! use; `manual_seed` replaces it with a deterministic one.

use std::cell::RefCell;

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;

use super::{Device, Shape, Tensor};
use crate::error::Result;

thread_local! {
    static DEFAULT_GENERATOR: RefCell<Option<Generator>> = const { RefCell::new(None) };
}

/// Reseed this thread's default generator.
pub fn manual_seed(seed: u64) {
    DEFAULT_GENERATOR.with(|g| *g.borrow_mut() = Some(Generator::new(seed)));
}

pub(crate) fn with_default<R>(f: impl FnOnce(&mut Generator) -> R) -> R {
    DEFAULT_GENERATOR.with(|cell| {
        let mut slot = cell.borrow_mut();
        let generator = slot.get_or_insert_with(Generator::from_entropy);
        f(generator)
    })
}

/// A reproducible stream of standard-normal samples.
pub struct Generator {
    rng: StdRng,
    normal: Normal,
}

impl Generator {
    pub fn new(seed: u64) -> Self {
        Generator {
            rng: StdRng::seed_from_u64(seed),
            normal: Normal::standard(),
        }
    }

    pub fn from_entropy() -> Self {
        Generator {
            rng: StdRng::from_entropy(),
            normal: Normal::standard(),
        }
    }

    pub fn sample(&mut self, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| self.normal.sample(&mut self.rng) as f32)
            .collect()
    }

    pub fn randn(&mut self, shape: impl Into<Shape>, device: Device) -> Result<Tensor> {
        let shape = shape.into();
        let data = self.sample(super::storage_len(&shape)?);
        Tensor::from_slice(shape, &data, device)
    }
}
