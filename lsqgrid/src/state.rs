use std::{path::Path, str::FromStr, sync::Arc};

use tracing::{info, warn};

use crate::{
    analysis::{self, FreedomAnalysis},
    device::{Device, MemoryUsage},
    error::{CompilationError, ConfigurationError, Error, MisuseError},
    id::StateId,
    params::ProblemParams,
    plan::{Buffers, Plan},
    problem::{Problem, SolverKind},
    real::{Precision, Real},
    solver::{
        SolveStatus, SolveSummary, SolverParams, StepOutcome,
        engine::{self, Kernels},
    },
    textual::{self, ProblemSource},
};

/// Settings fixed for the lifetime of a [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    /// Plans use `f64` buffers and reductions if set, otherwise `f32`.
    pub double_precision: bool,
    /// 0 only warns on failure. 1 also reports every iteration.
    pub verbosity: u8,
    /// Record how long each kernel runs. See [`Plan::kernel_timings`].
    pub collect_kernel_timing: bool,
    /// Worker threads on the device. 0 means one per core.
    pub threads: usize,
    /// Cap on workspace bytes held by all live plans together.
    pub memory_limit: Option<usize>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            double_precision: false,
            verbosity: 0,
            collect_kernel_timing: false,
            threads: 0,
            memory_limit: None,
        }
    }
}

impl InitParams {
    /// Set [`Self::double_precision`].
    pub fn with_double_precision(mut self, double_precision: bool) -> Self {
        self.double_precision = double_precision;
        self
    }
    /// Set [`Self::verbosity`].
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }
    /// Set [`Self::collect_kernel_timing`].
    pub fn with_kernel_timing(mut self, collect_kernel_timing: bool) -> Self {
        self.collect_kernel_timing = collect_kernel_timing;
        self
    }
    /// Set [`Self::threads`].
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
    /// Set [`Self::memory_limit`].
    pub fn with_memory_limit(mut self, memory_limit: Option<usize>) -> Self {
        self.memory_limit = memory_limit;
        self
    }
}

/// A solver context: precision, diagnostics and the compute device.
/// Every problem and plan is created by, and must be used with, one State.
///
/// ```
/// # use lsqgrid::{InitParams, ProblemParams, SolverKind, SolverParams, State};
/// let state = State::new(InitParams::default().with_double_precision(true))?;
/// let problem = state.define_source(
///     "# problem\ndim N\nunknown offset\nimage data[N]\n# energy\nover N: offset - data\n",
///     SolverKind::GaussNewton,
/// )?;
/// let mut plan = state.plan(&problem, &[4])?;
/// let data = [1.0, 2.0, 3.0, 6.0];
/// let mut offset = [0.0];
/// let mut params = ProblemParams::new(&problem);
/// params.unknown("offset", &mut offset)?.image("data", &data)?;
/// let summary = state.solve(&mut plan, &mut params, &SolverParams::default())?;
/// assert!(summary.converged());
/// drop(params);
/// assert!((offset[0] - 3.0).abs() < 1e-9);
/// # Ok::<(), lsqgrid::Error>(())
/// ```
#[derive(Debug)]
pub struct State {
    id: StateId,
    precision: Precision,
    verbosity: u8,
    collect_kernel_timing: bool,
    device: Device,
}

fn check_owner(expected: StateId, actual: StateId, handle: &'static str) -> Result<(), MisuseError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MisuseError::ForeignState { handle })
    }
}

fn check_initialized(plan: &Plan, operation: &'static str) -> Result<(), MisuseError> {
    if matches!(plan.progress.status, SolveStatus::Uninitialized) {
        Err(MisuseError::NotInitialized { operation })
    } else {
        Ok(())
    }
}

/// Borrow a plan's workspace at whichever precision it was built with.
macro_rules! with_workspace {
    ($buffers:expr, $ws:ident => $body:expr) => {
        match $buffers {
            Buffers::Single($ws) => $body,
            Buffers::Double($ws) => $body,
        }
    };
}

impl State {
    /// Validate the settings and start the device.
    pub fn new(params: InitParams) -> Result<Self, Error> {
        if params.verbosity > 1 {
            return Err(ConfigurationError::InvalidVerbosity(params.verbosity).into());
        }
        let device = Device::new(params.threads, params.memory_limit)?;
        let precision = if params.double_precision {
            Precision::Double
        } else {
            Precision::Single
        };
        if params.verbosity >= 1 {
            info!(%precision, threads = device.threads(), "state created");
        }
        Ok(Self {
            id: StateId::next_id(),
            precision,
            verbosity: params.verbosity,
            collect_kernel_timing: params.collect_kernel_timing,
            device,
        })
    }

    /// Element width of every plan this State builds.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Worker threads on the device.
    pub fn threads(&self) -> usize {
        self.device.threads()
    }

    /// Workspace currently held by live plans.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.device.usage()
    }

    /// Read and compile a problem file.
    pub fn define(&self, path: impl AsRef<Path>, kind: SolverKind) -> Result<Problem, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| CompilationError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        self.define_source(&text, kind)
    }

    /// Compile problem text.
    pub fn define_source(&self, text: &str, kind: SolverKind) -> Result<Problem, Error> {
        let source = ProblemSource::from_str(text)?;
        let compiled = textual::compile(&source, kind)?;
        if self.verbosity >= 1 {
            for warning in &compiled.warnings {
                info!(?warning, "problem compiled with a warning");
            }
        }
        Ok(Problem {
            inner: Arc::new(compiled),
            state_id: self.id,
        })
    }

    /// Release a problem. Errors if plans built from it are still alive;
    /// the problem is released regardless and those plans keep working.
    pub fn delete_problem(&self, problem: Problem) -> Result<(), Error> {
        check_owner(self.id, problem.state_id, "Problem")?;
        match problem.live_plans() {
            0 => Ok(()),
            live => Err(MisuseError::ProblemHasLivePlans { live }.into()),
        }
    }

    /// Instantiate a problem at concrete dimension sizes, one per declared `dim`.
    /// Reserves and allocates the plan's whole workspace, or nothing at all.
    pub fn plan(&self, problem: &Problem, dims: &[u32]) -> Result<Plan, Error> {
        check_owner(self.id, problem.state_id, "Problem")?;
        let plan = Plan::new(
            &self.device,
            &problem.inner,
            self.id,
            self.precision,
            dims,
            self.collect_kernel_timing,
        )?;
        if self.verbosity >= 1 {
            info!(
                ?dims,
                unknowns = plan.num_unknowns(),
                residuals = plan.num_residuals(),
                bytes = plan.workspace_bytes(),
                "plan built"
            );
        }
        Ok(plan)
    }

    /// Release a plan's workspace. Dropping it does the same.
    pub fn free_plan(&self, plan: Plan) -> Result<(), Error> {
        check_owner(self.id, plan.state_id, "Plan")
            .map_err(Error::from)
    }

    fn check(&self, plan: &Plan, params: &ProblemParams<'_>) -> Result<(), MisuseError> {
        check_owner(self.id, plan.state_id, "Plan")?;
        if Arc::ptr_eq(&plan.problem, &params.problem) {
            Ok(())
        } else {
            Err(MisuseError::ParamsForOtherProblem)
        }
    }

    /// Bind parameters and start a fresh solve from the unknowns' current values.
    pub fn init(
        &self,
        plan: &mut Plan,
        params: &ProblemParams<'_>,
        solver: &SolverParams,
    ) -> Result<(), Error> {
        self.check(plan, params)?;
        let kernels = Kernels {
            device: &self.device,
            problem: &plan.problem,
            layout: &plan.layout,
            verbosity: self.verbosity,
        };
        let progress = &mut plan.progress;
        with_workspace!(&mut plan.buffers, ws => self.device.run(|| {
            engine::init(&kernels, ws, progress, params, solver)
        }))
    }

    /// Run one outer iteration, then write the unknowns back into `params`.
    pub fn step(
        &self,
        plan: &mut Plan,
        params: &mut ProblemParams<'_>,
        solver: &SolverParams,
    ) -> Result<StepOutcome, Error> {
        self.check(plan, params)?;
        let kernels = Kernels {
            device: &self.device,
            problem: &plan.problem,
            layout: &plan.layout,
            verbosity: self.verbosity,
        };
        let progress = &mut plan.progress;
        with_workspace!(&mut plan.buffers, ws => self.device.run(|| {
            engine::step(&kernels, ws, progress, params, solver)
        }))
    }

    /// Init, then step until converged or failed.
    pub fn solve(
        &self,
        plan: &mut Plan,
        params: &mut ProblemParams<'_>,
        solver: &SolverParams,
    ) -> Result<SolveSummary, Error> {
        self.check(plan, params)?;
        let kernels = Kernels {
            device: &self.device,
            problem: &plan.problem,
            layout: &plan.layout,
            verbosity: self.verbosity,
        };
        let (precision, progress) = (plan.precision, &mut plan.progress);
        let summary = with_workspace!(&mut plan.buffers, ws => self.device.run(|| {
            engine::solve(&kernels, precision, ws, progress, params, solver)
        }))?;
        if self.verbosity >= 1 {
            info!("\n{summary}");
        } else if let StepOutcome::Failed(error) = &summary.outcome {
            warn!(%error, iterations = summary.iterations, "solve failed");
        }
        Ok(summary)
    }

    fn kernels<'a>(&'a self, plan: &'a Plan) -> Kernels<'a> {
        Kernels {
            device: &self.device,
            problem: &plan.problem,
            layout: &plan.layout,
            verbosity: self.verbosity,
        }
    }

    /// Sum of squared residuals at the plan's current unknowns.
    /// Writes nothing, so it can be called between Steps.
    pub fn current_cost(&self, plan: &Plan) -> Result<f64, Error> {
        check_owner(self.id, plan.state_id, "Plan")?;
        check_initialized(plan, "CurrentCost")?;
        let kernels = self.kernels(plan);
        Ok(with_workspace!(&plan.buffers, ws => self.device.run(|| {
            engine::current_cost(&kernels, ws).widen()
        })))
    }

    /// Each energy term's sum of squared residuals, in term order.
    pub fn term_costs(&self, plan: &Plan) -> Result<Vec<f64>, Error> {
        check_owner(self.id, plan.state_id, "Plan")?;
        check_initialized(plan, "TermCosts")?;
        let kernels = self.kernels(plan);
        Ok(with_workspace!(&plan.buffers, ws => self.device.run(|| {
            engine::term_costs(&kernels, ws)
        })))
    }

    /// Rank, degrees of freedom and conditioning of the Jacobian at the current unknowns.
    /// Builds the Jacobian densely, so only small plans can be analyzed.
    pub fn analyze(&self, plan: &Plan) -> Result<FreedomAnalysis, Error> {
        check_owner(self.id, plan.state_id, "Plan")?;
        check_initialized(plan, "Analyze")?;
        let kernels = self.kernels(plan);
        let analysis = with_workspace!(&plan.buffers, ws => self.device.run(|| {
            analysis::analyze(&kernels, ws)
        }))?;
        Ok(analysis)
    }

    /// One grid term's residuals at the current unknowns, as a grayscale image.
    #[cfg(feature = "residual-viz")]
    pub fn residual_image(&self, plan: &Plan, term: usize) -> Result<image::GrayImage, Error> {
        check_owner(self.id, plan.state_id, "Plan")?;
        check_initialized(plan, "ResidualImage")?;
        let kernels = self.kernels(plan);
        let image = with_workspace!(&plan.buffers, ws => self.device.run(|| {
            crate::residual_viz::render(&kernels, ws, term)
        }))?;
        Ok(image)
    }
}
