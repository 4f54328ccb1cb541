//! Elementwise graph IR.
//!
//! A `Graph` is an SSA list of scalar operations applied independently at
//! every element position. Operands always refer to earlier nodes, so the
//! node order is a valid evaluation order. Tracing produces a graph,
//! `optimize` rewrites it, and the backends either interpret it or lower it
//! to a fused kernel.

pub mod optimize;
pub mod trace;


use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;

use crate::error::{KilnError, Result};

pub use optimize::optimize;
pub use trace::{trace, Traceable, Traced};

// ─── Operations ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Square,
    Sqrt,
    Exp,
    Log,
    Relu,
    Sigmoid,
    Tanh,
    Recip,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Square => "square",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Recip => "recip",
        }
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Square => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Recip => 1.0 / x,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Pow => "pow",
        }
    }

    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Max => a.max(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Pow => a.powf(b),
        }
    }

    /// Operand order never changes the result bits. `max`/`min` are
    /// excluded: `f32::max(0.0, -0.0)` depends on argument order.
    pub fn is_commutative(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Node {
    /// The k-th argument of the traced function.
    Input(usize),
    Const(f32),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
}

/// Hashable identity of a node: constants compare by bit pattern so NaN
/// constants are equal to themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum NodeKey {
    Input(usize),
    Const(u32),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
}

impl Node {
    pub fn operands(&self) -> Vec<NodeId> {
        match *self {
            Node::Input(_) | Node::Const(_) => Vec::new(),
            Node::Unary(_, a) => vec![a],
            Node::Binary(_, a, b) => vec![a, b],
        }
    }

    pub(crate) fn key(&self) -> NodeKey {
        match *self {
            Node::Input(k) => NodeKey::Input(k),
            Node::Const(v) => NodeKey::Const(v.to_bits()),
            Node::Unary(op, a) => NodeKey::Unary(op, a),
            Node::Binary(op, a, b) => NodeKey::Binary(op, a, b),
        }
    }

    /// Rewrite operand references through `map`.
    pub(crate) fn remap(&self, map: &[NodeId]) -> Node {
        match *self {
            Node::Input(k) => Node::Input(k),
            Node::Const(v) => Node::Const(v),
            Node::Unary(op, a) => Node::Unary(op, map[a.index()]),
            Node::Binary(op, a, b) => Node::Binary(op, map[a.index()], map[b.index()]),
        }
    }
}

// ─── Graph ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    inputs: usize,
    output: NodeId,
}

impl Graph {
    /// Build a graph, checking that it is well formed: operands precede
    /// their users, input indices are in range and the output exists.
    pub fn new(nodes: Vec<Node>, inputs: usize, output: NodeId) -> Result<Graph> {
        if output.index() >= nodes.len() {
            return Err(KilnError::trace(format!(
                "output {} is out of range for a graph of {} nodes",
                output,
                nodes.len()
            )));
        }
        for (i, node) in nodes.iter().enumerate() {
            if let Node::Input(k) = node {
                if *k >= inputs {
                    return Err(KilnError::trace(format!(
                        "%{} reads input {} but the graph takes {}",
                        i, k, inputs
                    )));
                }
            }
            for operand in node.operands() {
                if operand.index() >= i {
                    return Err(KilnError::trace(format!(
                        "%{} uses {} before it is defined",
                        i, operand
                    )));
                }
            }
        }
        Ok(Graph {
            nodes,
            inputs,
            output,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn inputs(&self) -> usize {
        self.inputs
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of non-leaf operations.
    pub fn op_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Unary(..) | Node::Binary(..)))
            .count()
    }

    /// Mark every node the output depends on.
    pub fn live_nodes(&self) -> Vec<bool> {
        let mut dag: DiGraph<(), ()> = DiGraph::with_capacity(self.nodes.len(), self.nodes.len());
        let indices: Vec<NodeIndex> = self.nodes.iter().map(|_| dag.add_node(())).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for operand in node.operands() {
                dag.add_edge(indices[i], indices[operand.index()], ());
            }
        }

        let mut live = vec![false; self.nodes.len()];
        let mut dfs = Dfs::new(&dag, indices[self.output.index()]);
        while let Some(ix) = dfs.next(&dag) {
            live[ix.index()] = true;
        }
        live
    }

    /// Evaluate the graph for one element position.
    ///
    /// `regs` is scratch space reused across positions.
    pub fn eval_scalar(&self, args: &[f32], regs: &mut Vec<f32>) -> f32 {
        regs.clear();
        for node in &self.nodes {
            let value = match *node {
                Node::Input(k) => args[k],
                Node::Const(v) => v,
                Node::Unary(op, a) => op.apply(regs[a.index()]),
                Node::Binary(op, a, b) => op.apply(regs[a.index()], regs[b.index()]),
            };
            regs.push(value);
        }
        regs[self.output.index()]
    }

    pub(crate) fn keys(&self) -> Vec<NodeKey> {
        self.nodes.iter().map(Node::key).collect()
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = (0..self.inputs).map(|k| format!("in{}", k)).collect();
        writeln!(f, "graph({}) {{", params.join(", "))?;
        for (i, node) in self.nodes.iter().enumerate() {
            write!(f, "  %{} = ", i)?;
            match node {
                Node::Input(k) => writeln!(f, "input {}", k)?,
                Node::Const(v) => writeln!(f, "const {:?}", v)?,
                Node::Unary(op, a) => writeln!(f, "{} {}", op.name(), a)?,
                Node::Binary(op, a, b) => writeln!(f, "{} {}, {}", op.name(), a, b)?,
            }
        }
        writeln!(f, "  return {}", self.output)?;
        write!(f, "}}")
    }
}
