//! Symbolic tracing of Rust closures into a `Graph`.
//!
//! A traced function receives `Traced` handles instead of tensors. Every
//! operation on a handle appends a node to the shared builder, so calling
//! the function once records its whole dataflow.

use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

use super::{BinaryOp, Graph, Node, NodeId, UnaryOp};
use crate::error::{KilnError, Result};

#[derive(Default)]
struct Builder {
    nodes: Vec<Node>,
    errors: Vec<String>,
}

/// A symbolic tensor recorded during tracing.
#[derive(Clone)]
pub struct Traced {
    builder: Rc<RefCell<Builder>>,
    id: NodeId,
}

impl Traced {
    fn push(&self, node: Node) -> Traced {
        let mut b = self.builder.borrow_mut();
        let id = NodeId(b.nodes.len() as u32);
        b.nodes.push(node);
        Traced {
            builder: Rc::clone(&self.builder),
            id,
        }
    }

    fn unary(&self, op: UnaryOp) -> Traced {
        self.push(Node::Unary(op, self.id))
    }

    fn binary(&self, op: BinaryOp, rhs: &Traced) -> Traced {
        if !Rc::ptr_eq(&self.builder, &rhs.builder) {
            self.builder.borrow_mut().errors.push(format!(
                "{} mixes values from two different traces",
                op.name()
            ));
            return self.clone();
        }
        self.push(Node::Binary(op, self.id, rhs.id))
    }

    fn binary_scalar(&self, op: BinaryOp, rhs: f32) -> Traced {
        let c = self.push(Node::Const(rhs));
        self.push(Node::Binary(op, self.id, c.id))
    }

    fn scalar_binary(&self, lhs: f32, op: BinaryOp) -> Traced {
        let c = self.push(Node::Const(lhs));
        self.push(Node::Binary(op, c.id, self.id))
    }

    pub fn square(&self) -> Traced {
        self.unary(UnaryOp::Square)
    }

    pub fn sqrt(&self) -> Traced {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn abs(&self) -> Traced {
        self.unary(UnaryOp::Abs)
    }

    pub fn exp(&self) -> Traced {
        self.unary(UnaryOp::Exp)
    }

    pub fn ln(&self) -> Traced {
        self.unary(UnaryOp::Log)
    }

    pub fn relu(&self) -> Traced {
        self.unary(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Traced {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Traced {
        self.unary(UnaryOp::Tanh)
    }

    pub fn recip(&self) -> Traced {
        self.unary(UnaryOp::Recip)
    }

    pub fn maximum(&self, other: &Traced) -> Traced {
        self.binary(BinaryOp::Max, other)
    }

    pub fn minimum(&self, other: &Traced) -> Traced {
        self.binary(BinaryOp::Min, other)
    }

    pub fn pow(&self, exponent: &Traced) -> Traced {
        self.binary(BinaryOp::Pow, exponent)
    }

    pub fn powf(&self, exponent: f32) -> Traced {
        self.binary_scalar(BinaryOp::Pow, exponent)
    }
}

macro_rules! traced_binary_ops {
    ($($trait:ident, $method:ident, $op:expr;)*) => {
        $(
            impl $trait<&Traced> for &Traced {
                type Output = Traced;
                fn $method(self, rhs: &Traced) -> Traced {
                    self.binary($op, rhs)
                }
            }

            impl $trait<Traced> for Traced {
                type Output = Traced;
                fn $method(self, rhs: Traced) -> Traced {
                    self.binary($op, &rhs)
                }
            }

            impl $trait<&Traced> for Traced {
                type Output = Traced;
                fn $method(self, rhs: &Traced) -> Traced {
                    self.binary($op, rhs)
                }
            }

            impl $trait<f32> for &Traced {
                type Output = Traced;
                fn $method(self, rhs: f32) -> Traced {
                    self.binary_scalar($op, rhs)
                }
            }

            impl $trait<f32> for Traced {
                type Output = Traced;
                fn $method(self, rhs: f32) -> Traced {
                    self.binary_scalar($op, rhs)
                }
            }

            impl $trait<&Traced> for f32 {
                type Output = Traced;
                fn $method(self, rhs: &Traced) -> Traced {
                    rhs.scalar_binary(self, $op)
                }
            }
        )*
    };
}

traced_binary_ops! {
    Add, add, BinaryOp::Add;
    Sub, sub, BinaryOp::Sub;
    Mul, mul, BinaryOp::Mul;
    Div, div, BinaryOp::Div;
}

impl Neg for &Traced {
    type Output = Traced;
    fn neg(self) -> Traced {
        self.unary(UnaryOp::Neg)
    }
}

impl Neg for Traced {
    type Output = Traced;
    fn neg(self) -> Traced {
        self.unary(UnaryOp::Neg)
    }
}

// ─── Traceable functions ───────────────────────────────────────────

/// A function of a fixed number of traced tensors.
///
/// `Args` only disambiguates arities; it is `(Traced,)` for unary and
/// `(Traced, Traced)` for binary functions.
pub trait Traceable<Args>: Send + Sync {
    const ARITY: usize;

    fn call_traced(&self, inputs: &[Traced]) -> Traced;
}

impl<F> Traceable<(Traced,)> for F
where
    F: Fn(&Traced) -> Traced + Send + Sync,
{
    const ARITY: usize = 1;

    fn call_traced(&self, inputs: &[Traced]) -> Traced {
        self(&inputs[0])
    }
}

impl<F> Traceable<(Traced, Traced)> for F
where
    F: Fn(&Traced, &Traced) -> Traced + Send + Sync,
{
    const ARITY: usize = 2;

    fn call_traced(&self, inputs: &[Traced]) -> Traced {
        self(&inputs[0], &inputs[1])
    }
}

/// Run `f` once on symbolic inputs and return the recorded graph.
pub fn trace<F, A>(f: &F) -> Result<Graph>
where
    F: Traceable<A>,
{
    let builder = Rc::new(RefCell::new(Builder::default()));
    let inputs: Vec<Traced> = (0..F::ARITY)
        .map(|k| {
            let mut b = builder.borrow_mut();
            let id = NodeId(b.nodes.len() as u32);
            b.nodes.push(Node::Input(k));
            Traced {
                builder: Rc::clone(&builder),
                id,
            }
        })
        .collect();

    let output = f.call_traced(&inputs);
    if !Rc::ptr_eq(&output.builder, &builder) {
        return Err(KilnError::trace(
            "function returned a value that was not derived from its inputs",
        ));
    }

    let b = builder.borrow();
    if let Some(first) = b.errors.first() {
        return Err(KilnError::trace(first.clone()));
    }
    Graph::new(b.nodes.clone(), F::ARITY, output.id)
}
