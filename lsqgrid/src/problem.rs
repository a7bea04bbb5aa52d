use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::{
    error::CompilationError, id::StateId, params::ParamSchema, tape::Tape, warnings::Warning,
};

/// Which outer loop a problem is solved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum SolverKind {
    /// Undamped Gauss-Newton. Every step is accepted. Tag `gaussNewtonGPU`.
    GaussNewton,
    /// Levenberg-Marquardt with step rejection and adaptive damping. Tag `LMGPU`.
    LevenbergMarquardt,
}

impl SolverKind {
    /// The tag used to name this solver kind in text.
    pub fn tag(self) -> &'static str {
        match self {
            SolverKind::GaussNewton => "gaussNewtonGPU",
            SolverKind::LevenbergMarquardt => "LMGPU",
        }
    }
}

impl FromStr for SolverKind {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gaussNewtonGPU" => Ok(Self::GaussNewton),
            "LMGPU" => Ok(Self::LevenbergMarquardt),
            other => Err(CompilationError::UnknownSolverKind(other.to_owned())),
        }
    }
}

impl std::fmt::Display for SolverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Whether an array is solved for or only read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArrayRole {
    Unknown,
    Image,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ArrayDecl {
    pub(crate) name: String,
    pub(crate) role: ArrayRole,
    /// Indices into [`CompiledProblem::dims`].
    pub(crate) dims: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GraphDecl {
    pub(crate) name: String,
    pub(crate) edge_dim: usize,
    pub(crate) endpoints: Vec<String>,
}

/// What a term is summed over.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Domain {
    /// Every cell of these dims, first dim fastest.
    Grid(Vec<usize>),
    /// Every edge of this graph.
    Graph(usize),
}

/// How a term reads an array at a work item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Access {
    /// The cell at this offset from the work item. Array dims equal the domain.
    Stencil(Vec<i32>),
    /// The only element of a zero-dimensional array.
    Broadcast,
    /// The element indexed by this endpoint of the current edge.
    Endpoint(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Load {
    pub(crate) array: usize,
    pub(crate) access: Access,
}

/// Derivative of a term's residual with respect to one load of an unknown.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Partial {
    pub(crate) slot: usize,
    pub(crate) tape: Tape,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EnergyTerm {
    pub(crate) line: usize,
    pub(crate) text: String,
    pub(crate) domain: Domain,
    pub(crate) loads: Vec<Load>,
    pub(crate) scalars_read: Vec<usize>,
    pub(crate) residual: Tape,
    pub(crate) partials: Vec<Partial>,
}

impl EnergyTerm {
    pub(crate) fn max_stack(&self) -> usize {
        self.partials
            .iter()
            .map(|p| p.tape.max_stack())
            .fold(self.residual.max_stack(), usize::max)
    }
}

/// Output of compiling a problem file. Never changes afterwards.
#[derive(Debug)]
pub(crate) struct CompiledProblem {
    pub(crate) kind: SolverKind,
    pub(crate) dims: Vec<String>,
    pub(crate) arrays: Vec<ArrayDecl>,
    pub(crate) scalars: Vec<String>,
    pub(crate) graphs: Vec<GraphDecl>,
    pub(crate) terms: Vec<EnergyTerm>,
    pub(crate) schema: ParamSchema,
    pub(crate) warnings: Vec<Warning>,
    /// Plans built from this problem which haven't been dropped yet.
    pub(crate) live_plans: AtomicUsize,
}

/// A compiled problem, owned by the caller.
/// Build [`crate::Plan`]s from it with [`crate::State::plan`].
#[derive(Debug)]
pub struct Problem {
    pub(crate) inner: Arc<CompiledProblem>,
    pub(crate) state_id: StateId,
}

impl Problem {
    /// Which outer loop this problem is solved with.
    pub fn kind(&self) -> SolverKind {
        self.inner.kind
    }

    /// Declared dimension names, in the order their sizes are given when planning.
    pub fn dimension_names(&self) -> impl Iterator<Item = &str> {
        self.inner.dims.iter().map(String::as_str)
    }

    /// How many sizes a plan needs.
    pub fn arity(&self) -> usize {
        self.inner.dims.len()
    }

    /// Every parameter the problem declares, in declaration order.
    pub fn schema(&self) -> &ParamSchema {
        &self.inner.schema
    }

    /// How many energy terms the problem sums.
    pub fn num_terms(&self) -> usize {
        self.inner.terms.len()
    }

    /// Source text of an energy term.
    pub fn term_text(&self, term: usize) -> Option<&str> {
        self.inner.terms.get(term).map(|t| t.text.as_str())
    }

    /// Endpoint labels of a declared graph, in the order their index buffers are bound.
    pub fn graph_endpoints(&self, name: &str) -> Option<&[String]> {
        self.inner
            .graphs
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.endpoints.as_slice())
    }

    /// Anything suspicious found while compiling.
    pub fn warnings(&self) -> &[Warning] {
        &self.inner.warnings
    }

    /// Plans built from this problem which are still alive.
    pub fn live_plans(&self) -> usize {
        self.inner.live_plans.load(Ordering::Acquire)
    }
}
