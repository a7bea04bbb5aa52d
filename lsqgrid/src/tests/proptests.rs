use std::str::FromStr;

use proptest::prelude::*;

use crate::{
    InitParams, ProblemParams, SolveStatus, SolverKind, SolverParams, State, StepOutcome,
    reduce,
    tests::double,
    textual::ProblemSource,
};

const SMOOTH_1D: &str = "\
# problem
dim N
unknown X[N]
image A[N]
scalar w
# energy
over N: w * (X - A)
over N: X(1) - X
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

/// Lines that parse on their own, to get past the first syntax error more often.
const FRAGMENTS: &[&str] = &[
    "# problem",
    "# energy",
    "dim N",
    "dim M",
    "unknown X[N]",
    "unknown X[N, M]",
    "unknown c",
    "image A[N]",
    "image A[M]",
    "scalar w",
    "graph G[N]: a, b",
    "graph G[M]: a",
    "over N: X - A",
    "over N: X(1) - X",
    "over N, M: X(0, -1) * w",
    "over N: c - A",
    "over G: X[a] - X[b]",
    "over G: c * X[a]",
    "over M: sqrt(X) / 0",
    "over N: X(1, 1)",
    "over G: X(1)",
    "over Q: X",
];

proptest! {
    #[test]
    fn gauss_newton_never_increases_a_convex_cost(
        data in prop::collection::vec(-10.0..10.0f64, 2..64),
        w in 0.1..5.0f64,
        start in -10.0..10.0f64,
    ) {
        let state = double();
        let problem = state.define_source(SMOOTH_1D, SolverKind::GaussNewton).unwrap();
        let mut plan = state.plan(&problem, &[data.len() as u32]).unwrap();
        let mut x = vec![start; data.len()];
        let mut params = ProblemParams::new(&problem);
        params
            .unknown("X", &mut x)
            .unwrap()
            .image("A", &data)
            .unwrap()
            .scalar("w", w)
            .unwrap();
        let solver = SolverParams::default().with_inner_iterations(5);
        state.init(&mut plan, &params, &solver).unwrap();

        let mut steps = 0;
        while state.step(&mut plan, &mut params, &solver).unwrap().is_continue() {
            steps += 1;
            prop_assert!(steps < solver.outer_iterations);
        }
        prop_assert!(!matches!(plan.status(), SolveStatus::Running));
        for stats in plan.history() {
            // Each inner iteration lowers the quadratic model, which is the cost here.
            prop_assert!(stats.cost_after <= stats.cost_before * (1.0 + 1e-12) + 1e-12);
        }
    }

    #[test]
    fn rejected_steps_raise_damping(
        x0 in -2.0..2.0f64,
        y0 in -2.0..2.0f64,
    ) {
        let state = double();
        let problem = state.define_source(ROSENBROCK, SolverKind::LevenbergMarquardt).unwrap();
        let mut plan = state.plan(&problem, &[1]).unwrap();
        let (mut x, mut y) = ([x0], [y0]);
        let mut params = ProblemParams::new(&problem);
        params.unknown("x", &mut x).unwrap().unknown("y", &mut y).unwrap();
        let solver = SolverParams::default()
            .with_initial_damping(1e-6)
            .with_outer_iterations(20);
        state.init(&mut plan, &params, &solver).unwrap();

        let mut outcome = StepOutcome::Continue;
        for _ in 0..solver.outer_iterations {
            outcome = state.step(&mut plan, &mut params, &solver).unwrap();
            if !outcome.is_continue() {
                break;
            }
        }
        prop_assert!(!outcome.is_continue());
        for stats in plan.history() {
            prop_assert!(stats.damping_trials.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(stats.damping_trials.len(), stats.rejected + 1);
            prop_assert!(stats.cost_after < stats.cost_before);
        }
    }

    #[test]
    fn reductions_ignore_thread_count(
        values in prop::collection::vec(-1e3..1e3f64, 0..5000),
    ) {
        let pool = |threads| rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();
        let one = pool(1).install(|| reduce::sum_sq(&values));
        let three = pool(3).install(|| reduce::sum_sq(&values));
        prop_assert_eq!(one.to_bits(), three.to_bits());

        let blocked = values
            .chunks(reduce::BLOCK)
            .map(|block| block.iter().fold(0.0, |acc, v| acc + v * v))
            .fold(0.0, |acc, p| acc + p);
        prop_assert_eq!(one.to_bits(), blocked.to_bits());
    }

    #[test]
    fn parser_never_panics(text in "\\PC*") {
        let _ = ProblemSource::from_str(&text);
    }

    #[test]
    fn compiler_never_panics(
        lines in prop::collection::vec(prop::sample::select(FRAGMENTS), 0..12),
    ) {
        let state = State::new(InitParams::default().with_threads(1)).unwrap();
        let _ = state.define_source(&lines.join("\n"), SolverKind::GaussNewton);
    }
}
