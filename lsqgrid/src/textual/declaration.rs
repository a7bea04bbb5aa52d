use super::Label;
use crate::expr::Func;

/// One line of the `# problem` section.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    /// `dim W`: a dimension whose size is given when planning.
    Dim(Label),
    /// `unknown X[W, H]`: an array solved for.
    Unknown {
        /// Array name.
        name: Label,
        /// Dimensions, empty for a single value.
        dims: Vec<Label>,
    },
    /// `image A[W, H]`: a read-only input array.
    Image {
        /// Array name.
        name: Label,
        /// Dimensions, empty for a single value.
        dims: Vec<Label>,
    },
    /// `scalar w`: a single read-only value.
    Scalar(Label),
    /// `graph G[E]: a, b`: one index buffer per endpoint, each with one entry per edge.
    Graph {
        /// Graph name.
        name: Label,
        /// Dimension counting the edges.
        edge_dim: Label,
        /// Endpoint names.
        endpoints: Vec<Label>,
    },
}

impl Declaration {
    /// The name this line declares.
    pub fn name(&self) -> &Label {
        match self {
            Declaration::Dim(name) | Declaration::Scalar(name) => name,
            Declaration::Unknown { name, .. }
            | Declaration::Image { name, .. }
            | Declaration::Graph { name, .. } => name,
        }
    }
}

/// One line of the `# energy` section.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    /// 1-based line number.
    pub line: usize,
    /// Dimensions (or a single graph) the term is summed over.
    pub domain: Vec<Label>,
    /// The residual, squared and summed over the domain.
    pub residual: Node,
    /// Source text of the line.
    pub text: String,
}

/// Binary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// Residual syntax tree, before names are resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A literal.
    Number(f64),
    /// A bare name: a scalar, a same-cell array read or a single-value array.
    Name(Label),
    /// `A(dx, dy)`: array read at an offset from the current cell.
    Stencil {
        /// Array name.
        array: Label,
        /// One offset per dimension.
        offsets: Vec<i32>,
    },
    /// `A[a]`: array read at the index stored in the edge's endpoint `a`.
    Endpoint {
        /// Array name.
        array: Label,
        /// Endpoint name.
        endpoint: Label,
    },
    /// Unary minus.
    Neg(Box<Node>),
    /// Binary arithmetic.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        lhs: Box<Node>,
        /// Right operand.
        rhs: Box<Node>,
    },
    /// Integer power.
    Pow(Box<Node>, i32),
    /// Elementary function.
    Call(Func, Box<Node>),
}

impl Node {
    pub(crate) fn binary(op: BinOp, lhs: Node, rhs: Node) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }
}
