//! Gauss-Newton and Levenberg-Marquardt over a plan.
//!
//! Every outer iteration linearizes the residuals, then solves the damped normal
//! equations `(J^T J + lambda I) delta = -J^T r` with matrix-free preconditioned
//! conjugate gradients. `J^T J` is never formed: applying it is a `J p` launch per
//! term followed by one transpose gather per term and Jacobian column.

pub(crate) mod engine;
mod kernels;
mod pcg;

use std::time::Duration;

use serde::Serialize;

use crate::{
    device::KernelTimings,
    error::{ConfigurationError, NumericDivergenceError},
    problem::SolverKind,
    real::Precision,
};

// Damping never shrinks below this, so it can always grow back.
const MIN_DAMPING: f64 = 1e-20;

/// Settings for Init, Step and Solve. Checked on every call that uses them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SolverParams {
    /// Step stops with [`ConvergenceReason::MaxIterations`] after this many outer iterations.
    pub outer_iterations: usize,
    /// Cap on conjugate gradient iterations per linear solve.
    pub inner_iterations: usize,
    /// Conjugate gradients stops once `|r| / |b|` is this small.
    pub inner_tolerance: f64,
    /// Converged once an iteration changes the cost by at most this fraction,
    /// or a Levenberg-Marquardt trial raises it by at most this fraction.
    /// Never tighter than 16 machine epsilons of the plan's precision.
    pub function_tolerance: f64,
    /// Converged once the largest gradient component is at most this.
    /// Never tighter than one machine epsilon times `1 + cost`.
    pub gradient_tolerance: f64,
    /// Levenberg-Marquardt damping after Init.
    pub initial_damping: f64,
    /// Damping is multiplied by this after a rejected step.
    pub damping_increase: f64,
    /// Damping is multiplied by this after an accepted step.
    pub damping_decrease: f64,
    /// Fail rather than damp beyond this.
    pub max_damping: f64,
    /// Fail after this many rejected steps in one iteration.
    pub max_damping_retries: usize,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            outer_iterations: 10,
            inner_iterations: 20,
            inner_tolerance: 1e-6,
            function_tolerance: 1e-12,
            gradient_tolerance: 1e-10,
            initial_damping: 1e-3,
            damping_increase: 10.0,
            damping_decrease: 0.3,
            max_damping: 1e16,
            max_damping_retries: 10,
        }
    }
}

impl SolverParams {
    /// Set [`Self::outer_iterations`].
    pub fn with_outer_iterations(mut self, outer_iterations: usize) -> Self {
        self.outer_iterations = outer_iterations;
        self
    }
    /// Set [`Self::inner_iterations`].
    pub fn with_inner_iterations(mut self, inner_iterations: usize) -> Self {
        self.inner_iterations = inner_iterations;
        self
    }
    /// Set [`Self::inner_tolerance`].
    pub fn with_inner_tolerance(mut self, inner_tolerance: f64) -> Self {
        self.inner_tolerance = inner_tolerance;
        self
    }
    /// Set [`Self::function_tolerance`].
    pub fn with_function_tolerance(mut self, function_tolerance: f64) -> Self {
        self.function_tolerance = function_tolerance;
        self
    }
    /// Set [`Self::gradient_tolerance`].
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }
    /// Set [`Self::initial_damping`].
    pub fn with_initial_damping(mut self, initial_damping: f64) -> Self {
        self.initial_damping = initial_damping;
        self
    }
    /// Set [`Self::damping_increase`].
    pub fn with_damping_increase(mut self, damping_increase: f64) -> Self {
        self.damping_increase = damping_increase;
        self
    }
    /// Set [`Self::damping_decrease`].
    pub fn with_damping_decrease(mut self, damping_decrease: f64) -> Self {
        self.damping_decrease = damping_decrease;
        self
    }
    /// Set [`Self::max_damping`].
    pub fn with_max_damping(mut self, max_damping: f64) -> Self {
        self.max_damping = max_damping;
        self
    }
    /// Set [`Self::max_damping_retries`].
    pub fn with_max_damping_retries(mut self, max_damping_retries: usize) -> Self {
        self.max_damping_retries = max_damping_retries;
        self
    }

    /// Check every setting is in range.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn check(
            name: &'static str,
            value: f64,
            ok: bool,
            reason: &'static str,
        ) -> Result<(), ConfigurationError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigurationError::InvalidSolverParam {
                    name,
                    value,
                    reason,
                })
            }
        }
        let finite_non_negative = |x: f64| x.is_finite() && x >= 0.0;

        check(
            "outer_iterations",
            self.outer_iterations as f64,
            self.outer_iterations > 0,
            "must be at least 1",
        )?;
        check(
            "inner_iterations",
            self.inner_iterations as f64,
            self.inner_iterations > 0,
            "must be at least 1",
        )?;
        for (name, value) in [
            ("inner_tolerance", self.inner_tolerance),
            ("function_tolerance", self.function_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
        ] {
            check(
                name,
                value,
                finite_non_negative(value),
                "must be finite and non-negative",
            )?;
        }
        check(
            "initial_damping",
            self.initial_damping,
            self.initial_damping.is_finite() && self.initial_damping > 0.0,
            "must be finite and positive",
        )?;
        check(
            "damping_increase",
            self.damping_increase,
            self.damping_increase.is_finite() && self.damping_increase > 1.0,
            "must be finite and greater than 1",
        )?;
        check(
            "damping_decrease",
            self.damping_decrease,
            self.damping_decrease > 0.0 && self.damping_decrease < 1.0,
            "must be between 0 and 1",
        )?;
        check(
            "max_damping",
            self.max_damping,
            self.max_damping.is_finite() && self.max_damping >= self.initial_damping,
            "must be finite and at least initial_damping",
        )?;
        Ok(())
    }
}

/// Why a solve stopped successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum ConvergenceReason {
    /// The gradient was small enough that no step was needed.
    GradientTolerance,
    /// The last step barely changed the cost.
    FunctionTolerance,
    /// Ran out of outer iterations.
    MaxIterations,
}

impl std::fmt::Display for ConvergenceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvergenceReason::GradientTolerance => write!(f, "gradient tolerance reached"),
            ConvergenceReason::FunctionTolerance => write!(f, "function tolerance reached"),
            ConvergenceReason::MaxIterations => write!(f, "maximum outer iterations reached"),
        }
    }
}

/// What one Step did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepOutcome {
    /// More steps can make progress.
    Continue,
    /// Done. Further steps return this again without doing any work.
    Converged(ConvergenceReason),
    /// The iteration broke down. Further steps return this again without doing any work.
    Failed(NumericDivergenceError),
}

impl StepOutcome {
    /// True if stepping again would do more work.
    pub fn is_continue(&self) -> bool {
        matches!(self, StepOutcome::Continue)
    }
}

/// Where a plan's solve is up to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SolveStatus {
    /// Init hasn't been called.
    Uninitialized,
    /// Init was called and no terminal state has been reached.
    Running,
    /// Stopped successfully.
    Converged(ConvergenceReason),
    /// Stopped because the iteration broke down.
    Failed(NumericDivergenceError),
}

/// Per-iteration statistics, printed Ceres-style when verbose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStats {
    /// 1-based outer iteration.
    pub iteration: usize,
    /// Cost at the start of the iteration.
    pub cost_before: f64,
    /// Cost at the accepted unknowns.
    pub cost_after: f64,
    /// Largest component of `J^T r`.
    pub gradient_norm: f64,
    /// Euclidean norm of the accepted update.
    pub step_norm: f64,
    /// Damping of each step tried, in order. The last one was accepted.
    /// Empty for Gauss-Newton.
    pub damping_trials: Vec<f64>,
    /// Steps rejected before one was accepted.
    pub rejected: usize,
    /// Conjugate gradient iterations of the accepted step.
    pub inner_iterations: usize,
    /// Relative conjugate gradient residual of the accepted step.
    pub inner_residual: f64,
    /// Wall time of the whole Step.
    pub duration: Duration,
}

impl IterationStats {
    pub(crate) const HEADER: &str = "iter           cost    cost_change   |gradient|       |step|      damping  rejected  cg_iter   cg_residual   iter_time";
}

impl std::fmt::Display for IterationStats {
    #[mutants::skip]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>11.2e}  {:>8}  {:>7}  {:>12.2e}  {:>8.2}ms",
            self.iteration,
            self.cost_after,
            self.cost_before - self.cost_after,
            self.gradient_norm,
            self.step_norm,
            self.damping_trials.last().copied().unwrap_or(0.0),
            self.rejected,
            self.inner_iterations,
            self.inner_residual,
            self.duration.as_secs_f64() * 1e3,
        )
    }
}

/// Result of [`crate::State::solve`].
#[derive(Debug, Clone, Serialize)]
pub struct SolveSummary {
    /// Outer loop used.
    pub kind: SolverKind,
    /// Precision the plan ran in.
    pub precision: Precision,
    /// How the last Step ended.
    pub outcome: StepOutcome,
    /// Outer iterations completed.
    pub iterations: usize,
    /// Cost after Init.
    pub initial_cost: f64,
    /// Cost at the final unknowns.
    pub final_cost: f64,
    /// Every iteration, in order.
    pub history: Vec<IterationStats>,
    /// Wall time of the whole solve.
    pub duration: Duration,
}

impl SolveSummary {
    /// True if the solve converged.
    pub fn converged(&self) -> bool {
        matches!(self.outcome, StepOutcome::Converged(_))
    }
}

impl std::fmt::Display for SolveSummary {
    #[mutants::skip]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} solve ({} precision)", self.kind, self.precision)?;
        match &self.outcome {
            StepOutcome::Converged(reason) => writeln!(f, "CONVERGED: {reason}")?,
            StepOutcome::Failed(e) => writeln!(f, "FAILED: {e}")?,
            StepOutcome::Continue => writeln!(f, "STOPPED")?,
        }
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-300)
        )?;
        writeln!(f)?;
        let rejected: usize = self.history.iter().map(|s| s.rejected).sum();
        let inner: usize = self.history.iter().map(|s| s.inner_iterations).sum();
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Outer:              {}", self.iterations)?;
        writeln!(f, "  Inner (CG):         {inner}")?;
        writeln!(f, "  Rejected steps:     {rejected}")?;
        writeln!(f)?;
        writeln!(
            f,
            "Total time: {:.2}ms",
            self.duration.as_secs_f64() * 1e3
        )
    }
}

/// A plan's solver state between calls.
#[derive(Debug)]
pub(crate) struct Progress {
    pub(crate) status: SolveStatus,
    pub(crate) iteration: usize,
    pub(crate) damping: f64,
    pub(crate) history: Vec<IterationStats>,
    pub(crate) timings: Option<KernelTimings>,
}

impl Progress {
    pub(crate) fn new(collect_kernel_timing: bool) -> Self {
        Self {
            status: SolveStatus::Uninitialized,
            iteration: 0,
            damping: 0.0,
            history: Vec::new(),
            timings: collect_kernel_timing.then(KernelTimings::default),
        }
    }
}
