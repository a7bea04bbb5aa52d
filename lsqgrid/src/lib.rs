//! Least-squares grid solver.
//!
//! Minimizes a sum of squared energy terms over large arrays of unknowns (images,
//! grids, graphs) with data-parallel Gauss-Newton or Levenberg-Marquardt.
//! A problem is written as text (see [`textual`]), compiled once, then instantiated
//! as a [`Plan`] at concrete sizes and solved with Init / Step / Solve through the
//! [`State`] that created it.

pub use crate::analysis::{
    FreedomAnalysis, MAX_DENSE_ENTRIES, MAX_DENSE_UNKNOWNS, UnknownElement,
};
pub use crate::device::{KernelTiming, KernelTimings, MemoryUsage};
pub use crate::error::{
    AllocationError, AnalysisError, CompilationError, ConfigurationError,
    DimensionMismatchError, Error, MisuseError, NumericDivergenceError,
};
pub use crate::params::{BufferMut, BufferRef, ParamKind, ParamSchema, ProblemParams};
pub use crate::plan::Plan;
pub use crate::problem::{Problem, SolverKind};
pub use crate::real::Precision;
pub use crate::solver::{
    ConvergenceReason, IterationStats, SolveStatus, SolveSummary, SolverParams, StepOutcome,
};
pub use crate::state::{InitParams, State};
pub use crate::warnings::{Warning, WarningContent};

/// Dense diagnostics on small plans.
mod analysis;
/// The compute device: worker pool and memory ledger.
mod device;
mod error;
/// Expression trees and their symbolic derivatives.
mod expr;
mod id;
/// Typed bindings of caller buffers.
mod params;
/// Problems instantiated at concrete sizes.
mod plan;
/// Compiled problems.
mod problem;
mod real;
/// Deterministic parallel reductions.
mod reduce;
/// Residual images of grid terms.
#[cfg(feature = "residual-viz")]
mod residual_viz;
/// Gauss-Newton and Levenberg-Marquardt.
mod solver;
mod state;
/// Bytecode for residuals and partial derivatives.
mod tape;
/// Unit tests
#[cfg(test)]
mod tests;
/// Parser for textual representation of these problems.
pub mod textual;
mod warnings;
