use rayon::prelude::*;

use crate::ir::{Graph, Node};

/// Elements evaluated per rayon task.
const CHUNK: usize = 4096;

/// Evaluate the whole graph per element, in parallel chunks.
pub(super) fn fused(graph: &Graph, inputs: &[&[f32]], len: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; len];
    out.par_chunks_mut(CHUNK).enumerate().for_each(|(c, chunk)| {
        let base = c * CHUNK;
        let mut regs = Vec::with_capacity(graph.len());
        let mut args = vec![0.0f32; inputs.len()];
        for (j, slot) in chunk.iter_mut().enumerate() {
            for (arg, input) in args.iter_mut().zip(inputs) {
                *arg = input[base + j];
            }
            *slot = graph.eval_scalar(&args, &mut regs);
        }
    });
    out
}

/// Materialize every live node as a full array, one op at a time.
pub(super) fn unfused(graph: &Graph, inputs: &[&[f32]], len: usize) -> Vec<f32> {
    let live = graph.live_nodes();
    let mut values: Vec<Vec<f32>> = Vec::with_capacity(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        if !live[i] {
            values.push(Vec::new());
            continue;
        }
        let value = match *node {
            Node::Input(k) => inputs[k].to_vec(),
            Node::Const(v) => vec![v; len],
            Node::Unary(op, a) => values[a.index()].par_iter().map(|&x| op.apply(x)).collect(),
            Node::Binary(op, a, b) => values[a.index()]
                .par_iter()
                .zip(&values[b.index()])
                .map(|(&x, &y)| op.apply(x, y))
                .collect(),
        };
        values.push(value);
    }
    std::mem::take(&mut values[graph.output().index()])
}
