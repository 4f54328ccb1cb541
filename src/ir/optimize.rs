//! Graph optimizer.
//!
//! Runs rewrite passes until the graph stops changing. Every pass keeps the
//! SSA order intact: a node is only ever replaced by itself rewritten or by
//! an alias to an earlier node.
use std::collections::HashMap;

use super::{BinaryOp, Graph, Node, NodeId, UnaryOp};

/// Apply all passes until a fixed point is reached.
pub fn optimize(graph: &Graph) -> Graph {
    let mut g = graph.clone();
    loop {
        let before = g.keys();
        g = fold_constants(&g);
        g = simplify(&g);
        g = eliminate_common(&g);
        g = eliminate_dead(&g);
        if g.keys() == before {
            break;
        }
    }
    g
}

/// Result of rewriting a single node.
enum Rewrite {
    Keep(Node),
    Alias(NodeId),
}

/// Rebuild `graph`, letting `f` replace each node after its operands have
/// been remapped. Aliased nodes stay in place as dead code until
/// `eliminate_dead` removes them.
fn rewrite(graph: &Graph, mut f: impl FnMut(&[Node], Node) -> Rewrite) -> Graph {
    let mut nodes: Vec<Node> = Vec::with_capacity(graph.len());
    let mut map: Vec<NodeId> = Vec::with_capacity(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        let remapped = node.remap(&map);
        match f(&nodes, remapped) {
            Rewrite::Keep(n) => {
                nodes.push(n);
                map.push(NodeId(i as u32));
            }
            Rewrite::Alias(target) => {
                nodes.push(remapped);
                map.push(target);
            }
        }
    }
    let output = map[graph.output().index()];
    Graph {
        nodes,
        inputs: graph.inputs(),
        output,
    }
}

fn constant(nodes: &[Node], id: NodeId) -> Option<f32> {
    match nodes[id.index()] {
        Node::Const(v) => Some(v),
        _ => None,
    }
}

/// Evaluate operations whose operands are all constants.
fn fold_constants(graph: &Graph) -> Graph {
    rewrite(graph, |nodes, node| match node {
        Node::Unary(op, a) => match constant(nodes, a) {
            Some(x) => Rewrite::Keep(Node::Const(op.apply(x))),
            None => Rewrite::Keep(node),
        },
        Node::Binary(op, a, b) => match (constant(nodes, a), constant(nodes, b)) {
            (Some(x), Some(y)) => Rewrite::Keep(Node::Const(op.apply(x, y))),
            _ => Rewrite::Keep(node),
        },
        _ => Rewrite::Keep(node),
    })
}

/// Algebraic identities that hold exactly in IEEE arithmetic.
fn simplify(graph: &Graph) -> Graph {
    rewrite(graph, |nodes, node| match node {
        Node::Binary(BinaryOp::Mul, a, b) if a == b => {
            Rewrite::Keep(Node::Unary(UnaryOp::Square, a))
        }
        Node::Binary(BinaryOp::Mul, a, b) if constant(nodes, b) == Some(1.0) => Rewrite::Alias(a),
        Node::Binary(BinaryOp::Mul, a, b) if constant(nodes, a) == Some(1.0) => Rewrite::Alias(b),
        Node::Binary(BinaryOp::Div, a, b) if constant(nodes, b) == Some(1.0) => Rewrite::Alias(a),
        Node::Binary(BinaryOp::Add, a, b) if is_negative_zero(nodes, b) => Rewrite::Alias(a),
        Node::Binary(BinaryOp::Sub, a, b) if is_positive_zero(nodes, b) => Rewrite::Alias(a),
        Node::Binary(BinaryOp::Pow, a, b) if constant(nodes, b) == Some(2.0) => {
            Rewrite::Keep(Node::Unary(UnaryOp::Square, a))
        }
        Node::Binary(BinaryOp::Pow, a, b) if constant(nodes, b) == Some(1.0) => Rewrite::Alias(a),
        Node::Unary(UnaryOp::Neg, a) => match nodes[a.index()] {
            Node::Unary(UnaryOp::Neg, inner) => Rewrite::Alias(inner),
            _ => Rewrite::Keep(node),
        },
        _ => Rewrite::Keep(node),
    })
}

// `x + 0.0` turns `-0.0` into `+0.0`, so only `x + (-0.0)` is an identity.
// `x - 0.0` is exact for every `x`.
fn is_negative_zero(nodes: &[Node], id: NodeId) -> bool {
    constant(nodes, id).is_some_and(|v| v == 0.0 && v.is_sign_negative())
}

fn is_positive_zero(nodes: &[Node], id: NodeId) -> bool {
    constant(nodes, id).is_some_and(|v| v == 0.0 && v.is_sign_positive())
}

/// Common-subexpression elimination. Commutative operands are ordered so
/// `a * b` and `b * a` share a node.
fn eliminate_common(graph: &Graph) -> Graph {
    let mut seen: HashMap<super::NodeKey, NodeId> = HashMap::new();
    rewrite(graph, |nodes, node| {
        let canonical = match node {
            Node::Binary(op, a, b) if op.is_commutative() && b < a => Node::Binary(op, b, a),
            other => other,
        };
        let key = canonical.key();
        match seen.get(&key) {
            Some(&existing) => Rewrite::Alias(existing),
            None => {
                seen.insert(key, NodeId(nodes.len() as u32));
                Rewrite::Keep(canonical)
            }
        }
    })
}

/// Drop nodes the output does not depend on and renumber the rest.
fn eliminate_dead(graph: &Graph) -> Graph {
    let live = graph.live_nodes();
    let mut map = vec![NodeId(0); graph.len()];
    let mut nodes = Vec::with_capacity(graph.len());
    for (i, node) in graph.nodes().iter().enumerate() {
        if live[i] {
            map[i] = NodeId(nodes.len() as u32);
            nodes.push(node.remap(&map));
        }
    }
    Graph {
        nodes,
        inputs: graph.inputs(),
        output: map[graph.output().index()],
    }
}

#[cfg(test)]
mod tests {
    use std::ops::Neg;

    use super::*;
    use crate::ir::trace::{trace, Traced};

    #[test]
    fn test_mul_self_becomes_square() {
        let g = trace(&|x: &Traced| x * x).unwrap();
        let opt = optimize(&g);
        assert_eq!(
            opt.nodes(),
            &[Node::Input(0), Node::Unary(UnaryOp::Square, NodeId(0))]
        );
    }

    #[test]
    fn test_pow_two_becomes_square() {
        let g = trace(&|x: &Traced| x.powf(2.0)).unwrap();
        let opt = optimize(&g);
        assert_eq!(opt.op_count(), 1);
        assert!(matches!(
            opt.node(opt.output()),
            Node::Unary(UnaryOp::Square, _)
        ));
    }

    #[test]
    fn test_constants_fold() {
        let g = Graph::new(
            vec![
                Node::Input(0),
                Node::Const(3.0),
                Node::Const(4.0),
                Node::Binary(BinaryOp::Mul, NodeId(1), NodeId(2)),
                Node::Unary(UnaryOp::Neg, NodeId(3)),
                Node::Binary(BinaryOp::Add, NodeId(0), NodeId(4)),
            ],
            1,
            NodeId(5),
        )
        .unwrap();
        let opt = optimize(&g);
        assert_eq!(
            opt.nodes(),
            &[
                Node::Input(0),
                Node::Const(-12.0),
                Node::Binary(BinaryOp::Add, NodeId(0), NodeId(1)),
            ]
        );
    }

    #[test]
    fn test_identities_are_removed() {
        let g = trace(&|x: &Traced| ((x * 1.0) / 1.0 - 0.0).neg().neg()).unwrap();
        let opt = optimize(&g);
        assert_eq!(opt.nodes(), &[Node::Input(0)]);
        assert_eq!(opt.output(), NodeId(0));
    }

    #[test]
    fn test_add_positive_zero_is_kept() {
        let g = trace(&|x: &Traced| x + 0.0).unwrap();
        let opt = optimize(&g);
        assert_eq!(opt.op_count(), 1);
    }

    #[test]
    fn test_common_subexpressions_merge() {
        let g = trace(&|x: &Traced, y: &Traced| (x + y) * (y + x)).unwrap();
        let opt = optimize(&g);
        // in0, in1, add, square
        assert_eq!(opt.len(), 4);
        assert!(matches!(
            opt.node(opt.output()),
            Node::Unary(UnaryOp::Square, _)
        ));
    }

    #[test]
    fn test_dead_nodes_are_removed() {
        let g = trace(&|x: &Traced| {
            let _unused = x.exp().sqrt();
            x.square()
        })
        .unwrap();
        assert_eq!(g.len(), 4);
        let opt = optimize(&g);
        assert_eq!(opt.len(), 2);
    }

    #[test]
    fn test_unused_input_keeps_arity() {
        let g = trace(&|x: &Traced, _y: &Traced| x.abs()).unwrap();
        let opt = optimize(&g);
        assert_eq!(opt.inputs(), 2);
        assert_eq!(opt.len(), 2);
    }

    #[test]
    fn test_optimized_graph_evaluates_the_same() {
        let f = |x: &Traced| ((x * x) + (x * 1.0)).maximum(&(-x).neg()) / 1.0;
        let g = trace(&f).unwrap();
        let opt = optimize(&g);
        let mut regs = Vec::new();
        for v in [-3.5f32, -1.0, -0.0, 0.0, 0.25, 7.0] {
            let a = g.eval_scalar(&[v], &mut regs);
            let b = opt.eval_scalar(&[v], &mut regs);
            assert_eq!(a.to_bits(), b.to_bits(), "mismatch at {}", v);
        }
    }

    #[test]
    fn test_max_min_keep_operand_order() {
        let g = trace(&|x: &Traced, y: &Traced| y.maximum(x) + y.minimum(x)).unwrap();
        let opt = optimize(&g);
        assert_eq!(
            opt.nodes(),
            &[
                Node::Input(0),
                Node::Input(1),
                Node::Binary(BinaryOp::Max, NodeId(1), NodeId(0)),
                Node::Binary(BinaryOp::Min, NodeId(1), NodeId(0)),
                Node::Binary(BinaryOp::Add, NodeId(2), NodeId(3)),
            ]
        );
        let mut regs = Vec::new();
        for (x, y) in [(0.0f32, -0.0f32), (-0.0, 0.0)] {
            let a = g.eval_scalar(&[x, y], &mut regs);
            let b = opt.eval_scalar(&[x, y], &mut regs);
            assert_eq!(a.to_bits(), b.to_bits(), "mismatch at ({}, {})", x, y);
        }
    }

    #[test]
    fn test_nan_constants_reach_fixed_point() {
        let g = trace(&|x: &Traced| x + f32::NAN).unwrap();
        let opt = optimize(&g);
        assert_eq!(opt.len(), 3);
    }
}
