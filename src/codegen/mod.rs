//! WGSL lowering for elementwise graphs.
//!
//! One graph becomes one compute kernel: every invocation loads its element
//! from each input, evaluates the whole graph in registers and stores one
//! result. Bindings `0..n` are the inputs, binding `n` is the output.


use std::fmt::Write;

use crate::gpu::shaders;
use crate::ir::{BinaryOp, Graph, Node, UnaryOp};

/// A generated compute kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kernel {
    /// `kernel_` followed by the first 16 hex digits of the fingerprint.
    pub name: String,
    pub source: String,
    /// blake3 of the kernel text (hex).
    pub fingerprint: String,
    pub inputs: usize,
    pub workgroup_size: u32,
}

/// Lower `graph` to a fused WGSL kernel.
pub fn lower(graph: &Graph, workgroup_size: u32) -> Kernel {
    let mut bindings = String::new();
    for k in 0..graph.inputs() {
        let _ = writeln!(
            bindings,
            "@group(0) @binding({}) var<storage, read> in{}: array<f32>;",
            k, k
        );
    }
    let _ = write!(
        bindings,
        "@group(0) @binding({}) var<storage, read_write> out: array<f32>;",
        graph.inputs()
    );

    let mut body = String::new();
    for (i, node) in graph.nodes().iter().enumerate() {
        let _ = writeln!(body, "    let v{} = {};", i, expr(node));
    }
    let _ = write!(body, "    out[i] = v{};", graph.output().0);

    let text = shaders::ELEMENTWISE
        .replace("{{bindings}}", &bindings)
        .replace("{{workgroup_size}}", &workgroup_size.to_string())
        .replace("{{body}}", &body);
    let fingerprint = blake3::hash(text.as_bytes()).to_hex().to_string();
    let name = format!("kernel_{}", &fingerprint[..16]);
    let source = text.replace("{{name}}", &name);

    Kernel {
        name,
        source,
        fingerprint,
        inputs: graph.inputs(),
        workgroup_size,
    }
}

fn expr(node: &Node) -> String {
    match *node {
        Node::Input(k) => format!("in{}[i]", k),
        Node::Const(v) => literal(v),
        Node::Unary(op, a) => {
            let a = format!("v{}", a.0);
            match op {
                UnaryOp::Neg => format!("-{}", a),
                UnaryOp::Abs => format!("abs({})", a),
                UnaryOp::Square => format!("{} * {}", a, a),
                UnaryOp::Sqrt => format!("sqrt({})", a),
                UnaryOp::Exp => format!("exp({})", a),
                UnaryOp::Log => format!("log({})", a),
                UnaryOp::Relu => format!("max({}, 0.0f)", a),
                UnaryOp::Sigmoid => format!("1.0f / (1.0f + exp(-{}))", a),
                UnaryOp::Tanh => format!("tanh({})", a),
                UnaryOp::Recip => format!("1.0f / {}", a),
            }
        }
        Node::Binary(op, a, b) => {
            let (a, b) = (format!("v{}", a.0), format!("v{}", b.0));
            match op {
                BinaryOp::Add => format!("{} + {}", a, b),
                BinaryOp::Sub => format!("{} - {}", a, b),
                BinaryOp::Mul => format!("{} * {}", a, b),
                BinaryOp::Div => format!("{} / {}", a, b),
                BinaryOp::Max => format!("max({}, {})", a, b),
                BinaryOp::Min => format!("min({}, {})", a, b),
                BinaryOp::Pow => format!("pow({}, {})", a, b),
            }
        }
    }
}

/// WGSL has no literal for infinities or NaN, and a constant expression
/// may not evaluate to one. Non-finite values are bitcast from a pattern
/// mixed with the invocation index so the expression stays runtime.
fn literal(v: f32) -> String {
    if v.is_finite() {
        format!("{:?}f", v)
    } else {
        format!("bitcast<f32>({:#010x}u | (i & 0u))", v.to_bits())
    }
}
