use std::cell::RefCell;

use burn::backend::NdArray;
use burn::tensor::{Tensor as BurnTensor, TensorData};

use kiln::{
    compile, compile_with, square_fn, Backend, CompileOptions, Device, Generator, KilnError,
    Shape, Tensor, Traced,
};

fn random(shape: impl Into<Shape>, seed: u64) -> Tensor {
    Generator::new(seed).randn(shape, Device::Cpu).unwrap()
}

#[test]
fn test_compiled_square_matches_eager() {
    let compiled = compile(square_fn);
    let x = random([4, 4], 1);
    let y = compiled.call(&[&x]).unwrap();
    let expected = x.mul(&x).unwrap();
    assert_eq!(y.shape(), x.shape());
    assert_eq!(y.dtype(), x.dtype());
    assert_eq!(y.device(), Device::Cpu);
    assert!(y.allclose(&expected, 1e-6, 0.0).unwrap());
}

#[test]
fn test_compiled_square_matches_burn() {
    let x = random([4, 4], 2);
    let data = x.to_vec().unwrap();
    let b =
        BurnTensor::<NdArray, 2>::from_data(TensorData::new(data, [4, 4]), &Default::default());
    let oracle: Vec<f32> = (b.clone() * b).into_data().to_vec::<f32>().unwrap();

    let y = compile(square_fn).call(&[&x]).unwrap().to_vec().unwrap();
    assert_eq!(y.len(), oracle.len());
    for (got, want) in y.iter().zip(&oracle) {
        assert!((got - want).abs() <= 1e-6 * want.abs().max(1.0), "{} vs {}", got, want);
    }
}

#[test]
fn test_eager_backend_matches_fused() {
    let f = |x: &Traced| (x * 2.0 + 1.0).square().sigmoid();
    let fused = compile(f);
    let eager = compile_with(
        f,
        CompileOptions {
            backend: Backend::Eager,
            ..CompileOptions::default()
        },
    );
    let x = random([8, 8], 3);
    let a = fused.call(&[&x]).unwrap();
    let b = eager.call(&[&x]).unwrap();
    assert!(a.allclose(&b, 1e-5, 1e-6).unwrap());
}

#[test]
fn test_binary_function() {
    let compiled = compile(|x: &Traced, y: &Traced| (x - y).maximum(&(y * 0.5)));
    let x = Tensor::from_vec([3], vec![1.0, 4.0, -2.0]).unwrap();
    let y = Tensor::from_vec([3], vec![3.0, 1.0, -2.0]).unwrap();
    let out = compiled.call(&[&x, &y]).unwrap();
    assert_eq!(out.to_vec().unwrap(), vec![1.5, 3.0, 0.0]);
}

#[test]
fn test_traces_once_and_caches_per_guard() {
    let compiled = compile(square_fn);
    assert_eq!(compiled.stats().traces, 0);

    let x = random([4, 4], 4);
    for _ in 0..3 {
        compiled.call(&[&x]).unwrap();
    }
    let stats = compiled.stats();
    assert_eq!(stats.calls, 3);
    assert_eq!(stats.traces, 1);
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.cache_hits, 2);

    // A new shape on the same device reuses the artifact.
    compiled.call(&[&random([2, 8], 5)]).unwrap();
    assert_eq!(compiled.stats().compilations, 1);
    assert_eq!(compiled.stats().cache_hits, 3);
}

#[test]
fn test_arity_mismatch() {
    let compiled = compile(square_fn);
    let x = random([2, 2], 6);
    let err = compiled.call(&[&x, &x]).unwrap_err();
    assert!(matches!(err, KilnError::Arity { expected: 1, actual: 2 }));
    let err = compiled.call(&[]).unwrap_err();
    assert!(matches!(err, KilnError::Arity { expected: 1, actual: 0 }));
}

#[test]
fn test_shape_mismatch_between_inputs() {
    let compiled = compile(|x: &Traced, y: &Traced| x + y);
    let a = random([2, 2], 7);
    let b = random([4], 8);
    let err = compiled.call(&[&a, &b]).unwrap_err();
    assert!(matches!(err, KilnError::ShapeMismatch { .. }), "{}", err);
}

thread_local! {
    static LEAKED: RefCell<Option<Traced>> = const { RefCell::new(None) };
}

#[test]
fn test_trace_misuse_surfaces_on_call() {
    kiln::ir::trace(&|x: &Traced| {
        LEAKED.with(|l| *l.borrow_mut() = Some(x.clone()));
        x.square()
    })
    .unwrap();

    let compiled = compile(|x: &Traced| {
        let other = LEAKED.with(|l| l.borrow().clone()).unwrap();
        x * &other
    });
    let err = compiled.call(&[&random([2, 2], 9)]).unwrap_err();
    assert!(matches!(err, KilnError::Trace(_)), "{}", err);
    assert_eq!(compiled.stats().traces, 0);
}

#[test]
fn test_empty_and_scalar_tensors() {
    let compiled = compile(square_fn);
    let empty = Tensor::from_vec([0, 4], vec![]).unwrap();
    let out = compiled.call(&[&empty]).unwrap();
    assert_eq!(out.shape(), empty.shape());
    assert!(out.to_vec().unwrap().is_empty());

    let scalar = Tensor::from_vec(Vec::<usize>::new(), vec![-3.0]).unwrap();
    assert_eq!(compiled.call(&[&scalar]).unwrap().to_vec().unwrap(), vec![9.0]);
}

#[test]
fn test_missing_gpu_is_an_error() {
    let err = Tensor::randn([4, 4], Device::Gpu(1 << 20)).unwrap_err();
    assert!(err.is_no_adapter(), "{}", err);
    assert!(err.to_string().contains("gpu:1048576"), "{}", err);
}
