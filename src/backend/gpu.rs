use std::sync::Arc;

use crate::codegen::{self, Kernel};
use crate::error::Result;
use crate::gpu::{self, GpuBuffer, GpuContext};
use crate::ir::{Graph, Node, NodeId};

/// One dispatch of the fused kernel.
pub(super) fn fused(
    ctx: &Arc<GpuContext>,
    kernel: &Kernel,
    inputs: &[&GpuBuffer],
    len: usize,
) -> Result<GpuBuffer> {
    gpu::dispatch(ctx, kernel, inputs, len)
}

/// One dispatch per live operation. Constant operands are inlined into the
/// op's kernel; a constant result is uploaded as a filled buffer.
pub(super) fn unfused(
    ctx: &Arc<GpuContext>,
    graph: &Graph,
    inputs: &[Arc<GpuBuffer>],
    len: usize,
    workgroup_size: u32,
) -> Result<Arc<GpuBuffer>> {
    let live = graph.live_nodes();
    let mut values: Vec<Option<Arc<GpuBuffer>>> = Vec::with_capacity(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        if !live[i] {
            values.push(None);
            continue;
        }
        let value = match *node {
            Node::Input(k) => Arc::clone(&inputs[k]),
            Node::Const(v) if NodeId(i as u32) == graph.output() => {
                Arc::new(GpuBuffer::upload(ctx, &vec![v; len])?)
            }
            // Inlined by its users.
            Node::Const(_) => {
                values.push(None);
                continue;
            }
            Node::Unary(..) | Node::Binary(..) => {
                let (op_graph, operands) = single_op(graph, node)?;
                let kernel = codegen::lower(&op_graph, workgroup_size);
                let args: Vec<&GpuBuffer> = operands
                    .iter()
                    .filter_map(|id| values[id.index()].as_deref())
                    .collect();
                Arc::new(gpu::dispatch(ctx, &kernel, &args, len)?)
            }
        };
        values.push(Some(value));
    }
    values[graph.output().index()]
        .take()
        .ok_or_else(|| crate::error::KilnError::trace("graph output was never computed"))
}

/// A graph holding just `node`: its non-constant operands become inputs,
/// constant operands stay constants. Also returns which nodes of `graph`
/// feed the new inputs, in input order.
pub(super) fn single_op(graph: &Graph, node: &Node) -> Result<(Graph, Vec<NodeId>)> {
    let mut nodes = Vec::new();
    let mut operands: Vec<NodeId> = Vec::new();
    let mut map = Vec::new();
    for id in node.operands() {
        let local = match *graph.node(id) {
            Node::Const(v) => {
                nodes.push(Node::Const(v));
                NodeId(nodes.len() as u32 - 1)
            }
            _ => {
                let k = match operands.iter().position(|o| *o == id) {
                    Some(k) => k,
                    None => {
                        operands.push(id);
                        operands.len() - 1
                    }
                };
                nodes.push(Node::Input(k));
                NodeId(nodes.len() as u32 - 1)
            }
        };
        map.push(local);
    }
    let op = match *node {
        Node::Unary(op, _) => Node::Unary(op, map[0]),
        Node::Binary(op, _, _) => Node::Binary(op, map[0], map[1]),
        other => other,
    };
    nodes.push(op);
    let output = NodeId(nodes.len() as u32 - 1);
    Ok((Graph::new(nodes, operands.len(), output)?, operands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, UnaryOp};

    #[test]
    fn test_single_op_inlines_constants() {
        let graph = Graph::new(
            vec![
                Node::Input(0),
                Node::Const(2.0),
                Node::Binary(BinaryOp::Mul, NodeId(0), NodeId(1)),
            ],
            1,
            NodeId(2),
        )
        .unwrap();
        let (op, operands) = single_op(&graph, graph.node(NodeId(2))).unwrap();
        assert_eq!(operands, vec![NodeId(0)]);
        assert_eq!(op.inputs(), 1);
        assert_eq!(
            op.nodes(),
            &[
                Node::Input(0),
                Node::Const(2.0),
                Node::Binary(BinaryOp::Mul, NodeId(0), NodeId(1)),
            ]
        );
    }

    #[test]
    fn test_single_op_shares_repeated_operand() {
        let graph = Graph::new(
            vec![
                Node::Input(0),
                Node::Unary(UnaryOp::Exp, NodeId(0)),
                Node::Binary(BinaryOp::Add, NodeId(1), NodeId(1)),
            ],
            1,
            NodeId(2),
        )
        .unwrap();
        let (op, operands) = single_op(&graph, graph.node(NodeId(2))).unwrap();
        assert_eq!(operands, vec![NodeId(1)]);
        assert_eq!(op.inputs(), 1);
        assert_eq!(op.len(), 3);
    }
}
