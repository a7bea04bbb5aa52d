//! Init, Step and Solve, generic over the plan's precision.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::{
    ConvergenceReason, IterationStats, MIN_DAMPING, Progress, SolveStatus, SolveSummary,
    SolverParams, StepOutcome,
    kernels::{self, Inputs},
    pcg,
};
use crate::{
    device::{Device, KernelTimings},
    error::{Error, MisuseError, NumericDivergenceError},
    params::ProblemParams,
    plan::{Incidence, PlanLayout, Workspace, write_back},
    problem::{CompiledProblem, SolverKind},
    real::{Precision, Real},
    reduce::{add_into, all_finite, axpy, fill, norm_inf, sum_sq},
};

/// Launches a plan's kernels on its device, in schedule order.
pub(crate) struct Kernels<'a> {
    pub(crate) device: &'a Device,
    pub(crate) problem: &'a CompiledProblem,
    pub(crate) layout: &'a PlanLayout,
    pub(crate) verbosity: u8,
}

fn inputs<R: Real>(ws: &Workspace<R>) -> Inputs<'_, R> {
    Inputs {
        x: &ws.x,
        images: &ws.images,
        scalars: &ws.scalars,
        endpoints: &ws.endpoints,
    }
}

impl Kernels<'_> {
    fn residuals<R: Real>(
        &self,
        timings: &mut Option<KernelTimings>,
        inputs: &Inputs<'_, R>,
        masks: &[Vec<bool>],
        residual: &mut [R],
    ) {
        let terms = self.layout.terms.iter().zip(&self.problem.terms);
        for (t, (term, code)) in terms.enumerate() {
            let out = &mut residual[term.residual_offset..term.residual_offset + term.items];
            let mask = &masks[t];
            self.device
                .launch(timings, &self.layout.schedule.residual[t], || {
                    kernels::residuals(term, code, mask, inputs, out);
                });
        }
    }

    fn jacobian<R: Real>(
        &self,
        timings: &mut Option<KernelTimings>,
        inputs: &Inputs<'_, R>,
        masks: &[Vec<bool>],
        jacobian: &mut [R],
    ) {
        let terms = self.layout.terms.iter().zip(&self.problem.terms);
        for (t, (term, code)) in terms.enumerate() {
            let len = term.items * term.width();
            let out = &mut jacobian[term.jacobian_offset..term.jacobian_offset + len];
            let mask = &masks[t];
            self.device
                .launch(timings, &self.layout.schedule.jacobian[t], || {
                    kernels::jacobian(term, code, mask, inputs, out);
                });
        }
    }

    /// Cost from stored residuals: each term's sum of squares, added in term order.
    fn cost<R: Real>(&self, residual: &[R]) -> R {
        self.layout.terms.iter().fold(R::zero(), |acc, term| {
            acc + sum_sq(&residual[term.residual_offset..term.residual_offset + term.items])
        })
    }

    /// Per-term costs, evaluated without writing any buffer.
    fn term_costs<R: Real>(&self, inputs: &Inputs<'_, R>, masks: &[Vec<bool>]) -> Vec<R> {
        let terms = self.layout.terms.iter().zip(&self.problem.terms);
        terms
            .enumerate()
            .map(|(t, (term, code))| kernels::term_cost(term, code, &masks[t], inputs))
            .collect()
    }

    /// Same value, bit for bit, as [`Self::cost`] over freshly computed residuals.
    fn cost_on_the_fly<R: Real>(&self, inputs: &Inputs<'_, R>, masks: &[Vec<bool>]) -> R {
        self.term_costs(inputs, masks)
            .into_iter()
            .fold(R::zero(), |acc, c| acc + c)
    }

    /// `out = J^T q`, or the diagonal of `J^T J` if `q` is `None`.
    #[allow(clippy::too_many_arguments)]
    fn transpose<R: Real>(
        &self,
        timings: &mut Option<KernelTimings>,
        names: &[String],
        masks: &[Vec<bool>],
        jacobian: &[R],
        incidence: &[Incidence],
        q: Option<&[R]>,
        out: &mut [R],
    ) {
        fill(out, R::zero());
        for (g, gather) in self.layout.gathers.iter().enumerate() {
            let term = &self.layout.terms[gather.term];
            let array = &self.layout.arrays[gather.array];
            let jac = &jacobian[term.jacobian_offset..term.jacobian_offset + term.items * term.width()];
            let out = &mut out[array.offset..array.offset + array.len];
            let mask = &masks[gather.term];
            self.device.launch(timings, &names[g], || match q {
                Some(q) => {
                    let q = &q[term.residual_offset..term.residual_offset + term.items];
                    kernels::gather_transpose(gather, term, mask, jac, incidence, out, |w, j| {
                        j * q[w]
                    });
                }
                None => {
                    kernels::gather_transpose(gather, term, mask, jac, incidence, out, |_, j| {
                        j * j
                    });
                }
            });
        }
    }

    /// `out = J^T J p + lambda p`, through `jp = J p`.
    fn apply_normal<R: Real>(
        &self,
        timings: &mut Option<KernelTimings>,
        op: NormalOperator<'_, R>,
        jp: &mut [R],
        lambda: R,
        p: &[R],
        out: &mut [R],
    ) {
        for (t, term) in self.layout.terms.iter().enumerate() {
            let jac = &op.jacobian[term.jacobian_offset..term.jacobian_offset + term.items * term.width()];
            let jp = &mut jp[term.residual_offset..term.residual_offset + term.items];
            let mask = &op.masks[t];
            let endpoints = op.endpoints;
            self.device
                .launch(timings, &self.layout.schedule.apply_j[t], || {
                    kernels::apply_j(term, mask, jac, endpoints, p, jp);
                });
        }
        self.transpose(
            timings,
            &self.layout.schedule.apply_jt,
            op.masks,
            op.jacobian,
            op.incidence,
            Some(&*jp),
            out,
        );
        if lambda > R::zero() {
            axpy(out, lambda, p);
        }
    }
}

/// The read-only parts of a workspace that applying `J^T J` needs.
#[derive(Clone, Copy)]
struct NormalOperator<'a, R> {
    masks: &'a [Vec<bool>],
    jacobian: &'a [R],
    endpoints: &'a [Vec<Vec<u32>>],
    incidence: &'a [Incidence],
}

pub(crate) fn init<R: Real>(
    kernels: &Kernels<'_>,
    ws: &mut Workspace<R>,
    progress: &mut Progress,
    params: &ProblemParams<'_>,
    solver: &SolverParams,
) -> Result<(), Error> {
    solver.validate()?;
    ws.bind(kernels.layout, kernels.problem, params)?;
    progress.status = SolveStatus::Running;
    progress.iteration = 0;
    progress.damping = solver.initial_damping;
    progress.history.clear();
    if let Some(timings) = &mut progress.timings {
        *timings = KernelTimings::default();
    }
    if kernels.verbosity >= 1 {
        info!(
            kind = %kernels.problem.kind,
            unknowns = kernels.layout.n_unknowns,
            residuals = kernels.layout.n_residuals,
            "initialized"
        );
        info!("{}", IterationStats::HEADER);
    }
    Ok(())
}

fn fail(progress: &mut Progress, error: NumericDivergenceError) -> StepOutcome {
    warn!(%error, "solve failed");
    progress.status = SolveStatus::Failed(error.clone());
    StepOutcome::Failed(error)
}

fn converge(progress: &mut Progress, reason: ConvergenceReason, verbosity: u8) -> StepOutcome {
    if verbosity >= 1 {
        info!(iteration = progress.iteration, %reason, "converged");
    }
    progress.status = SolveStatus::Converged(reason);
    StepOutcome::Converged(reason)
}

pub(crate) fn step<R: Real>(
    kernels: &Kernels<'_>,
    ws: &mut Workspace<R>,
    progress: &mut Progress,
    params: &mut ProblemParams<'_>,
    solver: &SolverParams,
) -> Result<StepOutcome, Error> {
    match &progress.status {
        SolveStatus::Uninitialized => return Err(MisuseError::StepBeforeInit.into()),
        SolveStatus::Converged(reason) => return Ok(StepOutcome::Converged(*reason)),
        SolveStatus::Failed(error) => return Ok(StepOutcome::Failed(error.clone())),
        SolveStatus::Running => {}
    }
    solver.validate()?;
    ws.bind(kernels.layout, kernels.problem, params)?;

    let started = Instant::now();
    let iteration = progress.iteration;
    let verbosity = kernels.verbosity;
    let Workspace {
        x,
        x_trial,
        images,
        scalars,
        endpoints,
        incidence,
        masks,
        residual,
        jacobian,
        jp,
        gradient,
        diagonal,
        pcg: pcg_buffers,
    } = ws;
    let masks: &[Vec<bool>] = masks;
    let incidence: &[Incidence] = incidence;
    let endpoints: &[Vec<Vec<u32>>] = endpoints;
    let timings = &mut progress.timings;

    // Linearize at the current unknowns.
    let current = Inputs {
        x,
        images,
        scalars,
        endpoints,
    };
    kernels.residuals(timings, &current, masks, residual);
    let cost = kernels.cost(residual);
    if !all_finite(residual) || !cost.is_finite() {
        return Ok(fail(
            progress,
            NumericDivergenceError::NonFiniteResidual { iteration },
        ));
    }
    kernels.jacobian(timings, &current, masks, jacobian);
    let jacobian: &[R] = jacobian;
    if !all_finite(jacobian) {
        return Ok(fail(
            progress,
            NumericDivergenceError::NonFiniteJacobian { iteration },
        ));
    }
    let schedule = &kernels.layout.schedule;
    kernels.transpose(
        timings,
        &schedule.apply_jt,
        masks,
        jacobian,
        incidence,
        Some(&residual[..]),
        gradient,
    );
    let gradient_norm = norm_inf(gradient).widen();
    if gradient_norm <= gradient_tolerance::<R>(solver, cost.widen()) {
        return Ok(converge(
            progress,
            ConvergenceReason::GradientTolerance,
            verbosity,
        ));
    }
    kernels.transpose(
        timings,
        &schedule.diagonal,
        masks,
        jacobian,
        incidence,
        None,
        diagonal,
    );

    let operator = NormalOperator {
        masks,
        jacobian,
        endpoints,
        incidence,
    };
    let levenberg_marquardt = kernels.problem.kind == SolverKind::LevenbergMarquardt;
    let mut damping = if levenberg_marquardt {
        progress.damping
    } else {
        0.0
    };
    let mut damping_trials = Vec::new();
    let mut rejected = 0;
    let (inner, cost_after) = loop {
        let lambda = R::lit(damping);
        pcg::precondition(&mut pcg_buffers.preconditioner, diagonal, lambda);
        let inner = pcg::solve(
            |p, ap| kernels.apply_normal(timings, operator, jp, lambda, p, ap),
            gradient,
            pcg_buffers,
            solver.inner_iterations,
            solver.inner_tolerance,
        );
        if !all_finite(&pcg_buffers.delta) {
            return Ok(fail(
                progress,
                NumericDivergenceError::NonFiniteUpdate { iteration },
            ));
        }
        add_into(x_trial, x, &pcg_buffers.delta);
        let trial = Inputs {
            x: x_trial,
            images,
            scalars,
            endpoints,
        };
        let trial_cost = kernels
            .device
            .launch(timings, "trial_cost", || kernels.cost_on_the_fly(&trial, masks));
        if !levenberg_marquardt {
            break (inner, trial_cost);
        }
        damping_trials.push(damping);
        if trial_cost.is_finite() && trial_cost < cost {
            break (inner, trial_cost);
        }
        // No decrease this precision can resolve: the unknowns are already at the minimum.
        if trial_cost.is_finite()
            && (trial_cost - cost).widen() <= function_tolerance::<R>(solver) * cost.widen()
        {
            if verbosity >= 1 {
                debug!(iteration, damping, cost = cost.widen(), "trial step changes nothing");
            }
            return Ok(converge(
                progress,
                ConvergenceReason::FunctionTolerance,
                verbosity,
            ));
        }

        rejected += 1;
        if verbosity >= 1 {
            debug!(
                iteration,
                damping,
                cost = cost.widen(),
                trial_cost = trial_cost.widen(),
                "rejected step"
            );
        }
        damping *= solver.damping_increase;
        if rejected > solver.max_damping_retries || damping > solver.max_damping {
            return Ok(fail(
                progress,
                NumericDivergenceError::DampingExhausted {
                    iteration,
                    retries: rejected,
                    damping,
                },
            ));
        }
    };

    // Accept.
    std::mem::swap(x, x_trial);
    write_back(kernels.layout, x, params);
    if levenberg_marquardt {
        progress.damping = (damping * solver.damping_decrease).max(MIN_DAMPING);
    }
    progress.iteration += 1;

    let cost_before = cost.widen();
    let cost_after = cost_after.widen();
    let stats = IterationStats {
        iteration: progress.iteration,
        cost_before,
        cost_after,
        gradient_norm,
        step_norm: sum_sq(&pcg_buffers.delta).sqrt().widen(),
        damping_trials,
        rejected,
        inner_iterations: inner.iterations,
        inner_residual: inner.relative_residual,
        duration: started.elapsed(),
    };
    if verbosity >= 1 {
        info!("{stats}");
    }
    progress.history.push(stats);

    let function_tolerance = function_tolerance::<R>(solver);
    let outcome = if (cost_before - cost_after).abs() <= function_tolerance * cost_before {
        converge(progress, ConvergenceReason::FunctionTolerance, verbosity)
    } else if progress.iteration >= solver.outer_iterations {
        converge(progress, ConvergenceReason::MaxIterations, verbosity)
    } else {
        StepOutcome::Continue
    };
    Ok(outcome)
}

/// Relative cost changes below this many machine epsilons are round-off.
const COST_NOISE_EPSILONS: f64 = 16.0;

/// `function_tolerance`, floored at what precision `R` can resolve.
fn function_tolerance<R: Real>(solver: &SolverParams) -> f64 {
    solver
        .function_tolerance
        .max(COST_NOISE_EPSILONS * R::epsilon().widen())
}

/// `gradient_tolerance`, floored at the gradient's round-off for this cost at precision `R`.
fn gradient_tolerance<R: Real>(solver: &SolverParams, cost: f64) -> f64 {
    solver
        .gradient_tolerance
        .max(R::epsilon().widen() * (1.0 + cost))
}

pub(crate) fn solve<R: Real>(
    kernels: &Kernels<'_>,
    precision: Precision,
    ws: &mut Workspace<R>,
    progress: &mut Progress,
    params: &mut ProblemParams<'_>,
    solver: &SolverParams,
) -> Result<SolveSummary, Error> {
    let started = Instant::now();
    init(kernels, ws, progress, params, solver)?;
    let initial_cost = current_cost(kernels, ws).widen();
    let outcome = loop {
        let outcome = step(kernels, ws, progress, params, solver)?;
        if !outcome.is_continue() {
            break outcome;
        }
    };
    Ok(SolveSummary {
        kind: kernels.problem.kind,
        precision,
        outcome,
        iterations: progress.iteration,
        initial_cost,
        final_cost: current_cost(kernels, ws).widen(),
        history: progress.history.clone(),
        duration: started.elapsed(),
    })
}

/// Cost at the current unknowns. Reads the workspace, never writes it.
pub(crate) fn current_cost<R: Real>(kernels: &Kernels<'_>, ws: &Workspace<R>) -> R {
    kernels.cost_on_the_fly(&inputs(ws), &ws.masks)
}

pub(crate) fn term_costs<R: Real>(kernels: &Kernels<'_>, ws: &Workspace<R>) -> Vec<f64> {
    kernels
        .term_costs(&inputs(ws), &ws.masks)
        .into_iter()
        .map(Real::widen)
        .collect()
}

/// Residuals at the current unknowns, widened, for one term.
#[cfg(any(test, feature = "residual-viz"))]
pub(crate) fn term_residuals<R: Real>(
    kernels: &Kernels<'_>,
    ws: &Workspace<R>,
    term: usize,
) -> Vec<f64> {
    let layout = &kernels.layout.terms[term];
    let mut out = vec![R::zero(); layout.items];
    kernels::residuals(
        layout,
        &kernels.problem.terms[term],
        &ws.masks[term],
        &inputs(ws),
        &mut out,
    );
    out.into_iter().map(Real::widen).collect()
}

/// The Jacobian at the current unknowns, times `p`, as `f64`.
/// Used by dense analysis to build `J` one column at a time.
pub(crate) struct Linearization<R> {
    jacobian: Vec<R>,
    p: Vec<R>,
    out: Vec<R>,
}

impl<R: Real> Linearization<R> {
    pub(crate) fn new(kernels: &Kernels<'_>, ws: &Workspace<R>) -> Self {
        let mut jacobian = vec![R::zero(); kernels.layout.n_jacobian];
        kernels.jacobian(&mut None, &inputs(ws), &ws.masks, &mut jacobian);
        Self {
            jacobian,
            p: vec![R::zero(); kernels.layout.n_unknowns],
            out: vec![R::zero(); kernels.layout.n_residuals],
        }
    }

    /// Column `c` of `J`.
    pub(crate) fn column(&mut self, kernels: &Kernels<'_>, ws: &Workspace<R>, c: usize) -> Vec<f64> {
        self.p[c] = R::one();
        for (t, term) in kernels.layout.terms.iter().enumerate() {
            let jac = &self.jacobian[term.jacobian_offset..term.jacobian_offset + term.items * term.width()];
            let out = &mut self.out[term.residual_offset..term.residual_offset + term.items];
            kernels::apply_j(term, &ws.masks[t], jac, &ws.endpoints, &self.p, out);
        }
        self.p[c] = R::zero();
        self.out.iter().map(|v| v.widen()).collect()
    }
}
