use super::*;

mod proptests;

const CURVE_FIT: &str = "\
# problem
dim N
unknown offset
image data[N]
# energy
over N: offset - data
";

const ROSENBROCK: &str = "\
# problem
dim N
unknown x
unknown y
# energy
over N: 10 * (y - x^2)
over N: 1 - x
";

const SMOOTHING: &str = "\
# problem
dim W
dim H
unknown X[W, H]
image A[W, H]
scalar w_fit
# energy
over W, H: w_fit * (X - A)
over W, H: X(1, 0) - X
over W, H: X(0, 1) - X
";

const CHAIN: &str = "\
# problem
dim N
dim E
unknown X[N]
image anchor[N]
image gap[E]
scalar w
graph G[E]: a, b
# energy
over G: X[b] - X[a] - gap
over N: w * (X - anchor)
";

pub(crate) fn double() -> State {
    State::new(InitParams::default().with_double_precision(true)).unwrap()
}

pub(crate) fn assert_nearly_eq(actual: f64, expected: f64, tolerance: f64) {
    assert!(
        (actual - expected).abs() <= tolerance,
        "expected {expected}, got {actual}"
    );
}

fn smoothing_data(w: usize, h: usize) -> Vec<f64> {
    (0..w * h)
        .map(|i| {
            let (x, y) = ((i % w) as f64, (i / w) as f64);
            (0.3 * x).sin() + (0.2 * y).cos() + 0.1 * ((i * 7919) % 13) as f64
        })
        .collect()
}

#[test]
fn curve_fit() {
    let state = State::new(InitParams::default()).unwrap();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    assert!(problem.warnings().is_empty());
    let mut plan = state.plan(&problem, &[10]).unwrap();
    let data = [5.0; 10];
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();

    let solver = SolverParams::default();
    state.init(&mut plan, &params, &solver).unwrap();
    assert_nearly_eq(state.current_cost(&plan).unwrap(), 250.0, 1e-3);
    for _ in 0..5 {
        state.step(&mut plan, &mut params, &solver).unwrap();
    }
    assert!(state.current_cost(&plan).unwrap() < 1e-6);
    drop(params);
    assert_nearly_eq(offset[0], 5.0, 1e-5);
}

#[test]
fn gauss_newton_solves_linear_problems_in_one_step() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[4]).unwrap();
    let data = [1.0, 2.0, 3.0, 6.0];
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    let solver = SolverParams::default();
    state.init(&mut plan, &params, &solver).unwrap();

    assert_eq!(
        state.step(&mut plan, &mut params, &solver).unwrap(),
        StepOutcome::Continue
    );
    assert_eq!(plan.iteration(), 1);
    let stats = &plan.history()[0];
    assert_nearly_eq(stats.cost_before, 50.0, 1e-9);
    assert_nearly_eq(stats.cost_after, 14.0, 1e-9);
    assert!(stats.damping_trials.is_empty());
    assert_eq!(stats.rejected, 0);
    assert_nearly_eq(params.unknown_buffer_mut("offset").unwrap().get(0).unwrap(), 3.0, 1e-12);

    // Already at the minimum, so the gradient vanishes and no step is taken.
    assert_eq!(
        state.step(&mut plan, &mut params, &solver).unwrap(),
        StepOutcome::Converged(ConvergenceReason::GradientTolerance)
    );
    assert_eq!(plan.iteration(), 1);
    assert_eq!(plan.history().len(), 1);
}

#[test]
fn summaries_serialize() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[4]).unwrap();
    let data = [1.0, 2.0, 3.0, 6.0];
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    let summary = state
        .solve(&mut plan, &mut params, &SolverParams::default())
        .unwrap();
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["kind"], "GaussNewton");
    assert_eq!(json["precision"], "Double");
    assert_eq!(json["outcome"]["Converged"], "GradientTolerance");
    assert_eq!(json["history"].as_array().unwrap().len(), 1);
    assert_eq!(json["history"][0]["rejected"], 0);
}

#[test]
fn levenberg_marquardt_rejects_then_accepts() {
    let state = double();
    let problem = state
        .define_source(ROSENBROCK, SolverKind::LevenbergMarquardt)
        .unwrap();
    let mut plan = state.plan(&problem, &[1]).unwrap();
    let (mut x, mut y) = ([-1.2], [1.0]);
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("x", &mut x)
        .unwrap()
        .unknown("y", &mut y)
        .unwrap();
    let solver = SolverParams::default()
        .with_initial_damping(1e-9)
        .with_max_damping_retries(30)
        .with_outer_iterations(100);
    state.init(&mut plan, &params, &solver).unwrap();
    assert_nearly_eq(state.current_cost(&plan).unwrap(), 24.2, 1e-9);

    // The undamped step from here overshoots badly.
    let outcome = state.step(&mut plan, &mut params, &solver).unwrap();
    assert_eq!(outcome, StepOutcome::Continue);
    let stats = &plan.history()[0];
    assert!(stats.rejected >= 1);
    assert_eq!(stats.damping_trials.len(), stats.rejected + 1);
    assert!(stats.damping_trials.windows(2).all(|w| w[0] < w[1]));
    assert!(stats.cost_after < stats.cost_before);
    let accepted = *stats.damping_trials.last().unwrap();
    assert_nearly_eq(plan.damping(), accepted * solver.damping_decrease, 1e-30);

    let mut outcome = outcome;
    while outcome.is_continue() {
        outcome = state.step(&mut plan, &mut params, &solver).unwrap();
    }
    assert!(matches!(outcome, StepOutcome::Converged(_)), "{outcome:?}");
    assert!(state.current_cost(&plan).unwrap() < 1e-10);
    for stats in plan.history() {
        assert!(stats.cost_after < stats.cost_before);
    }
    drop(params);
    assert_nearly_eq(x[0], 1.0, 1e-4);
    assert_nearly_eq(y[0], 1.0, 1e-4);
}

#[test]
fn single_precision_levenberg_marquardt_converges_at_the_noise_floor() {
    let state = State::new(InitParams::default()).unwrap();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::LevenbergMarquardt)
        .unwrap();
    let mut plan = state.plan(&problem, &[10]).unwrap();
    let data = [3.1, 4.7, 5.2, 6.9, 4.4, 5.8, 3.9, 5.5, 4.1, 6.3];
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    let summary = state
        .solve(&mut plan, &mut params, &SolverParams::default())
        .unwrap();
    assert!(summary.converged(), "{summary}");
    assert!(
        matches!(
            summary.outcome,
            StepOutcome::Converged(
                ConvergenceReason::FunctionTolerance | ConvergenceReason::GradientTolerance
            )
        ),
        "{summary}"
    );
    assert_nearly_eq(summary.final_cost, 12.309, 1e-3);
    drop(params);
    assert_nearly_eq(offset[0], 4.99, 1e-4);
}

#[test]
fn single_precision_levenberg_marquardt_smooths() {
    let solve = |double_precision: bool| {
        let state =
            State::new(InitParams::default().with_double_precision(double_precision)).unwrap();
        let problem = state
            .define_source(SMOOTHING, SolverKind::LevenbergMarquardt)
            .unwrap();
        let (w, h) = (16, 12);
        let mut plan = state.plan(&problem, &[w as u32, h as u32]).unwrap();
        let data = smoothing_data(w, h);
        let mut x = vec![0.0f64; w * h];
        let mut params = ProblemParams::new(&problem);
        params
            .unknown("X", &mut x)
            .unwrap()
            .image("A", &data)
            .unwrap()
            .scalar("w_fit", 1.0)
            .unwrap();
        let solver = SolverParams::default().with_inner_iterations(200);
        state.solve(&mut plan, &mut params, &solver).unwrap()
    };
    let single = solve(false);
    let double = solve(true);
    assert!(single.converged(), "{single}");
    assert!(double.converged(), "{double}");
    assert_eq!(single.precision, Precision::Single);
    assert!(single.final_cost < single.initial_cost);
    assert_nearly_eq(
        single.final_cost,
        double.final_cost,
        1e-3 * double.final_cost,
    );
}

#[test]
fn smoothing_solve_reduces_cost() {
    let state = double();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let (w, h) = (16, 12);
    let mut plan = state.plan(&problem, &[w as u32, h as u32]).unwrap();
    assert_eq!(plan.num_unknowns(), w * h);
    assert_eq!(plan.num_residuals(), 3 * w * h);
    let data = smoothing_data(w, h);
    let mut x = vec![0.0f64; w * h];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("A", &data)
        .unwrap()
        .scalar("w_fit", 2.0)
        .unwrap();
    let solver = SolverParams::default().with_inner_iterations(200);
    let summary = state.solve(&mut plan, &mut params, &solver).unwrap();
    assert!(summary.converged(), "{summary}");
    assert!(summary.final_cost < summary.initial_cost);
    assert_eq!(summary.iterations, plan.iteration());
    assert_eq!(summary.history.len(), summary.iterations);

    let total: f64 = state.term_costs(&plan).unwrap().iter().sum();
    assert_nearly_eq(total, state.current_cost(&plan).unwrap(), 1e-9);
}

#[test]
fn graph_terms_solve() {
    let state = double();
    let problem = state.define_source(CHAIN, SolverKind::GaussNewton).unwrap();
    let n = 8;
    let mut plan = state.plan(&problem, &[n as u32, (n - 1) as u32]).unwrap();
    // Edges are listed back to front, so incidence lists see indices out of order.
    let a: Vec<u32> = (0..n as u32 - 1).rev().collect();
    let b: Vec<u32> = a.iter().map(|&i| i + 1).collect();
    let anchor: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let gap = vec![1.0f64; n - 1];
    let mut x = vec![0.0f64; n];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("anchor", &anchor)
        .unwrap()
        .image("gap", &gap)
        .unwrap()
        .scalar("w", 0.5)
        .unwrap()
        .graph("G", &[&a[..], &b[..]])
        .unwrap();
    let solver = SolverParams::default().with_inner_tolerance(1e-12);
    let summary = state.solve(&mut plan, &mut params, &solver).unwrap();
    assert!(summary.converged(), "{summary}");
    assert!(summary.final_cost < 1e-12);
    drop(params);
    for (i, x) in x.iter().enumerate() {
        assert_nearly_eq(*x, i as f64, 1e-6);
    }
}

#[test]
fn graph_indices_are_checked() {
    let state = double();
    let problem = state.define_source(CHAIN, SolverKind::GaussNewton).unwrap();
    let mut plan = state.plan(&problem, &[3, 2]).unwrap();
    let a: [u32; 2] = [0, 1];
    let b: [u32; 2] = [1, 3];
    let mut x = vec![0.0f64; 3];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("anchor", &[0.0, 1.0, 2.0])
        .unwrap()
        .image("gap", &[1.0, 1.0])
        .unwrap()
        .scalar("w", 1.0)
        .unwrap()
        .graph("G", &[&a[..], &b[..]])
        .unwrap();
    let err = state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap_err();
    assert!(
        matches!(
            &err,
            Error::DimensionMismatch(DimensionMismatchError::GraphIndexOutOfBounds {
                edge: 1,
                index: 3,
                len: 3,
                ..
            })
        ),
        "{err}"
    );
    assert_eq!(plan.status(), &SolveStatus::Uninitialized);
}

#[test]
fn nonexistent_file_leaves_state_usable() {
    let state = double();
    let err = state
        .define("test_cases/does_not_exist.lsq", SolverKind::GaussNewton)
        .unwrap_err();
    assert!(matches!(err, Error::Compilation(CompilationError::Io { .. })));
    assert_eq!(state.memory_usage(), MemoryUsage::default());
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    state.plan(&problem, &[3]).unwrap();
}

#[test]
fn problem_files_compile() {
    let state = double();
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../test_cases");
    for (file, kind) in [
        ("curve_fit.lsq", SolverKind::GaussNewton),
        ("smoothing.lsq", SolverKind::GaussNewton),
        ("rosenbrock.lsq", SolverKind::LevenbergMarquardt),
        ("springs.lsq", SolverKind::LevenbergMarquardt),
    ] {
        let problem = state.define(format!("{dir}/{file}"), kind);
        assert!(problem.is_ok(), "{file}: {problem:?}");
    }
}

#[test]
fn arity_mismatch_allocates_nothing() {
    let state = double();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let before = state.memory_usage();
    let err = state.plan(&problem, &[4]).unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch(DimensionMismatchError::Arity {
            expected: 2,
            actual: 1
        })
    ));
    assert_eq!(state.memory_usage(), before);
    assert_eq!(problem.live_plans(), 0);
}

#[test]
fn workspace_is_sized_by_dims() {
    let state = double();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let a = state.plan(&problem, &[8, 5]).unwrap();
    let b = state.plan(&problem, &[8, 5]).unwrap();
    let c = state.plan(&problem, &[9, 5]).unwrap();
    assert_eq!(a.workspace_bytes(), b.workspace_bytes());
    assert!(c.workspace_bytes() > a.workspace_bytes());
    assert_eq!(
        state.memory_usage().bytes,
        a.workspace_bytes() + b.workspace_bytes() + c.workspace_bytes()
    );
    assert_eq!(problem.live_plans(), 3);

    state.free_plan(a).unwrap();
    drop(b);
    state.free_plan(c).unwrap();
    assert_eq!(state.memory_usage(), MemoryUsage::default());
    assert_eq!(problem.live_plans(), 0);
}

#[test]
fn param_lengths_follow_dims() {
    let state = double();
    let problem = state.define_source(CHAIN, SolverKind::GaussNewton).unwrap();
    let plan = state.plan(&problem, &[6, 4]).unwrap();
    assert_eq!(plan.param_len("X"), Some(6));
    assert_eq!(plan.param_len("gap"), Some(4));
    assert_eq!(plan.param_len("G"), Some(4));
    assert_eq!(plan.param_len("w"), Some(1));
    assert_eq!(plan.param_len("nope"), None);
    assert_eq!(
        problem.graph_endpoints("G").unwrap(),
        &["a".to_owned(), "b".to_owned()]
    );
    assert!(problem.graph_endpoints("X").is_none());
}

#[test]
fn single_precision_halves_the_workspace() {
    let single = State::new(InitParams::default()).unwrap();
    let double = double();
    let p1 = single
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let p2 = double
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let a = single.plan(&p1, &[10, 10]).unwrap();
    let b = double.plan(&p2, &[10, 10]).unwrap();
    assert_eq!(a.precision(), Precision::Single);
    assert_eq!(b.precision(), Precision::Double);
    assert!(a.workspace_bytes() < b.workspace_bytes());
}

#[test]
fn memory_limit_is_all_or_nothing() {
    let state = State::new(
        InitParams::default()
            .with_double_precision(true)
            .with_memory_limit(Some(64 * 1024)),
    )
    .unwrap();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let small = state.plan(&problem, &[8, 8]).unwrap();
    let before = state.memory_usage();
    let err = state.plan(&problem, &[256, 256]).unwrap_err();
    assert!(matches!(
        err,
        Error::Allocation(AllocationError::DeviceMemoryExhausted { .. })
    ));
    assert_eq!(state.memory_usage(), before);
    assert_eq!(problem.live_plans(), 1);
    drop(small);
}

#[test]
fn current_cost_is_idempotent_and_matches_step() {
    let state = State::new(InitParams::default()).unwrap();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let (w, h) = (40, 40);
    let mut plan = state.plan(&problem, &[w as u32, h as u32]).unwrap();
    let data = smoothing_data(w, h);
    let mut x = vec![0.5f32; w * h];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("A", &data)
        .unwrap()
        .scalar("w_fit", 1.0)
        .unwrap();
    let solver = SolverParams::default();
    state.init(&mut plan, &params, &solver).unwrap();

    let first = state.current_cost(&plan).unwrap();
    let second = state.current_cost(&plan).unwrap();
    assert_eq!(first.to_bits(), second.to_bits());
    // Single precision reductions, widened.
    assert_eq!(f64::from(first as f32).to_bits(), first.to_bits());

    state.step(&mut plan, &mut params, &solver).unwrap();
    assert_eq!(plan.history()[0].cost_before.to_bits(), first.to_bits());
    let after = state.current_cost(&plan).unwrap();
    assert_eq!(plan.history()[0].cost_after.to_bits(), after.to_bits());
}

#[test]
fn results_do_not_depend_on_thread_count() {
    let solve = |threads: usize| {
        let state = State::new(
            InitParams::default()
                .with_double_precision(true)
                .with_threads(threads),
        )
        .unwrap();
        assert_eq!(state.threads(), threads);
        let problem = state
            .define_source(SMOOTHING, SolverKind::LevenbergMarquardt)
            .unwrap();
        let (w, h) = (64, 48);
        let mut plan = state.plan(&problem, &[w as u32, h as u32]).unwrap();
        let data = smoothing_data(w, h);
        let mut x = vec![0.0f64; w * h];
        let mut params = ProblemParams::new(&problem);
        params
            .unknown("X", &mut x)
            .unwrap()
            .image("A", &data)
            .unwrap()
            .scalar("w_fit", 0.7)
            .unwrap();
        let solver = SolverParams::default().with_outer_iterations(4);
        let summary = state.solve(&mut plan, &mut params, &solver).unwrap();
        drop(params);
        (summary.final_cost, x)
    };
    let (cost1, x1) = solve(1);
    let (cost4, x4) = solve(4);
    assert_eq!(cost1.to_bits(), cost4.to_bits());
    assert!(x1.iter().zip(&x4).all(|(a, b)| a.to_bits() == b.to_bits()));
}

#[test]
fn step_before_init_is_misuse() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[3]).unwrap();
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &[1.0, 2.0, 3.0])
        .unwrap();
    let solver = SolverParams::default();
    assert!(matches!(
        state.step(&mut plan, &mut params, &solver),
        Err(Error::Misuse(MisuseError::StepBeforeInit))
    ));
    assert!(matches!(
        state.current_cost(&plan),
        Err(Error::Misuse(MisuseError::NotInitialized {
            operation: "CurrentCost"
        }))
    ));
}

#[test]
fn missing_and_mistyped_params() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[3]).unwrap();
    let mut offset = [0.0];
    let mut params = ProblemParams::new(&problem);
    params.unknown("offset", &mut offset).unwrap();
    let err = state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Misuse(MisuseError::MissingParam(ref name)) if name == "data"
    ));

    params.image("data", &[1.0, 2.0]).unwrap();
    let err = state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch(DimensionMismatchError::BufferLength {
            expected: 3,
            actual: 2,
            ..
        })
    ));

    let err = state
        .init(
            &mut plan,
            &params,
            &SolverParams::default().with_damping_decrease(2.0),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Configuration(ConfigurationError::InvalidSolverParam {
            name: "damping_decrease",
            ..
        })
    ));
}

#[test]
fn handles_belong_to_their_state() {
    let a = double();
    let b = double();
    let problem = a.define_source(CURVE_FIT, SolverKind::GaussNewton).unwrap();
    assert!(matches!(
        b.plan(&problem, &[3]),
        Err(Error::Misuse(MisuseError::ForeignState { handle: "Problem" }))
    ));

    let mut plan = a.plan(&problem, &[3]).unwrap();
    let mut offset = [0.0];
    let data = [1.0, 2.0, 3.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    assert!(matches!(
        b.init(&mut plan, &params, &SolverParams::default()),
        Err(Error::Misuse(MisuseError::ForeignState { handle: "Plan" }))
    ));

    let other = a.define_source(CURVE_FIT, SolverKind::GaussNewton).unwrap();
    let other_params = ProblemParams::new(&other);
    assert!(matches!(
        a.init(&mut plan, &other_params, &SolverParams::default()),
        Err(Error::Misuse(MisuseError::ParamsForOtherProblem))
    ));
}

#[test]
fn deleting_a_problem_keeps_its_plans_working() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[3]).unwrap();
    let mut offset = [0.0];
    let data = [1.0, 2.0, 3.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    assert!(matches!(
        state.delete_problem(problem),
        Err(Error::Misuse(MisuseError::ProblemHasLivePlans { live: 1 }))
    ));
    let summary = state
        .solve(&mut plan, &mut params, &SolverParams::default())
        .unwrap();
    assert!(summary.converged());
    drop(params);
    assert_nearly_eq(offset[0], 2.0, 1e-9);

    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    state.delete_problem(problem).unwrap();
}

#[test]
fn divergence_is_terminal() {
    let state = double();
    let problem = state
        .define_source(
            "# problem\ndim N\nunknown x\n# energy\nover N: log(x) - 1\n",
            SolverKind::LevenbergMarquardt,
        )
        .unwrap();
    let mut plan = state.plan(&problem, &[1]).unwrap();
    let mut x = [-1.0];
    let mut params = ProblemParams::new(&problem);
    params.unknown("x", &mut x).unwrap();
    let solver = SolverParams::default();
    state.init(&mut plan, &params, &solver).unwrap();
    let failed = StepOutcome::Failed(NumericDivergenceError::NonFiniteResidual { iteration: 0 });
    assert_eq!(state.step(&mut plan, &mut params, &solver).unwrap(), failed);
    assert_eq!(state.step(&mut plan, &mut params, &solver).unwrap(), failed);
    assert!(matches!(plan.status(), SolveStatus::Failed(_)));
    assert_eq!(plan.iteration(), 0);

    // Init starts over from whatever the caller's buffers hold now.
    params.unknown_buffer_mut("x").unwrap().set(0, 1.0);
    state.init(&mut plan, &params, &solver).unwrap();
    assert_eq!(plan.status(), &SolveStatus::Running);
    let summary = state.solve(&mut plan, &mut params, &solver).unwrap();
    assert!(summary.converged(), "{summary}");
    drop(params);
    assert_nearly_eq(x[0], std::f64::consts::E, 1e-6);
}

#[test]
fn outer_cap_is_terminal() {
    let state = double();
    let problem = state
        .define_source(ROSENBROCK, SolverKind::LevenbergMarquardt)
        .unwrap();
    let mut plan = state.plan(&problem, &[1]).unwrap();
    let (mut x, mut y) = ([-1.2], [1.0]);
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("x", &mut x)
        .unwrap()
        .unknown("y", &mut y)
        .unwrap();
    let solver = SolverParams::default().with_outer_iterations(2);
    let summary = state.solve(&mut plan, &mut params, &solver).unwrap();
    assert!(summary.iterations <= 2);
    assert!(!summary.outcome.is_continue());
    if summary.iterations == 2 {
        assert_eq!(
            summary.outcome,
            StepOutcome::Converged(ConvergenceReason::MaxIterations)
        );
    }
}

#[test]
fn kernel_timings_follow_the_schedule() {
    let state = State::new(
        InitParams::default()
            .with_double_precision(true)
            .with_kernel_timing(true),
    )
    .unwrap();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[6, 6]).unwrap();
    let schedule: Vec<&str> = plan.kernel_schedule().collect();
    assert_eq!(&schedule[..3], ["residual[0]", "residual[1]", "residual[2]"]);
    assert!(schedule.contains(&"jtq[1.0]"));

    let data = smoothing_data(6, 6);
    let mut x = vec![0.0f64; 36];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("A", &data)
        .unwrap()
        .scalar("w_fit", 1.0)
        .unwrap();
    let solver = SolverParams::default();
    state.init(&mut plan, &params, &solver).unwrap();
    assert!(plan.kernel_timings().unwrap().is_empty());
    state.step(&mut plan, &mut params, &solver).unwrap();
    let timings = plan.kernel_timings().unwrap();
    assert_eq!(timings.get("residual[0]").unwrap().launches, 1);
    assert_eq!(timings.get("jacobian[2]").unwrap().launches, 1);
    let inner = plan.history()[0].inner_iterations as u64;
    assert!(timings.get("jp[0]").unwrap().launches >= inner);
}

#[test]
fn verbosity_is_zero_or_one() {
    assert!(matches!(
        State::new(InitParams::default().with_verbosity(2)),
        Err(Error::Configuration(ConfigurationError::InvalidVerbosity(2)))
    ));
    assert!(State::new(InitParams::default().with_verbosity(1)).is_ok());
}

#[test]
fn analysis_finds_free_directions() {
    let state = double();
    let problem = state
        .define_source(
            "# problem\ndim N\nunknown a\nunknown b\nunknown c\nimage data[N]\n# energy\nover N: a + b - data\nover N: c - 2\n",
            SolverKind::GaussNewton,
        )
        .unwrap();
    let mut plan = state.plan(&problem, &[5]).unwrap();
    let (mut a, mut b, mut c) = ([0.0], [0.0], [0.0]);
    let data = [1.0, 2.0, 3.0, 4.0, 5.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("a", &mut a)
        .unwrap()
        .unknown("b", &mut b)
        .unwrap()
        .unknown("c", &mut c)
        .unwrap()
        .image("data", &data)
        .unwrap();
    assert!(matches!(
        state.analyze(&plan),
        Err(Error::Misuse(MisuseError::NotInitialized { .. }))
    ));
    state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap();
    let analysis = state.analyze(&plan).unwrap();
    assert_eq!(analysis.rank, 2);
    assert_eq!(analysis.degrees_of_freedom, 1);
    assert!(analysis.is_underconstrained());
    assert!(analysis.condition_number.is_infinite());
    let free: Vec<&str> = analysis
        .underconstrained
        .iter()
        .map(|e| e.array.as_str())
        .collect();
    assert_eq!(free, ["a", "b"]);
}

#[test]
fn analysis_of_a_well_posed_fit() {
    let state = double();
    let problem = state
        .define_source(CURVE_FIT, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[4]).unwrap();
    let mut offset = [0.0];
    let data = [1.0, 2.0, 3.0, 4.0];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("offset", &mut offset)
        .unwrap()
        .image("data", &data)
        .unwrap();
    state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap();
    let analysis = state.analyze(&plan).unwrap();
    assert_eq!(analysis.rank, 1);
    assert!(!analysis.is_underconstrained());
    assert!(analysis.underconstrained.is_empty());
    // J is a column of ones, so its only singular value is sqrt(4).
    assert_nearly_eq(analysis.singular_values[0], 2.0, 1e-12);
    assert_nearly_eq(analysis.condition_number, 1.0, 1e-12);
}

#[test]
fn analysis_is_capped() {
    let state = double();
    let problem = state
        .define_source(SMOOTHING, SolverKind::GaussNewton)
        .unwrap();
    let mut plan = state.plan(&problem, &[64, 64]).unwrap();
    let data = vec![0.0f64; 64 * 64];
    let mut x = vec![0.0f64; 64 * 64];
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("A", &data)
        .unwrap()
        .scalar("w_fit", 1.0)
        .unwrap();
    state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap();
    assert!(matches!(
        state.analyze(&plan),
        Err(Error::Analysis(AnalysisError::TooLarge {
            unknowns: 4096,
            ..
        }))
    ));
}
