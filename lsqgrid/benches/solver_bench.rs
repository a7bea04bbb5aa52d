//! Benchmarks for the lsqgrid solver.
use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lsqgrid::{InitParams, ProblemParams, SolverKind, SolverParams, State};

fn test_case(name: &str) -> String {
    std::fs::read_to_string(format!(
        "{}/../test_cases/{name}",
        env!("CARGO_MANIFEST_DIR")
    ))
    .unwrap()
}

fn noisy_image(w: usize, h: usize) -> Vec<f32> {
    (0..w * h)
        .map(|i| {
            let (x, y) = ((i % w) as f32, (i / w) as f32);
            (0.05 * x).sin() * (0.07 * y).cos() + 0.2 * ((i * 7919 % 17) as f32 / 17.0 - 0.5)
        })
        .collect()
}

/// Whole solves of the smoothing problem at growing sizes.
fn solve_smoothing(c: &mut Criterion) {
    let txt = test_case("smoothing.lsq");
    let mut group = c.benchmark_group("smoothing");
    for &side in &[64usize, 256] {
        let size = (side * side) as u64;
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &side, |b, &side| {
            let state = State::new(InitParams::default()).unwrap();
            let problem = state.define_source(&txt, SolverKind::GaussNewton).unwrap();
            let mut plan = state.plan(&problem, &[side as u32, side as u32]).unwrap();
            let data = noisy_image(side, side);
            let solver = SolverParams::default().with_outer_iterations(3);
            b.iter(|| {
                let mut x = data.clone();
                let mut params = ProblemParams::new(&problem);
                params
                    .unknown("X", &mut x)
                    .unwrap()
                    .image("A", &data)
                    .unwrap()
                    .scalar("w_fit", 1.0)
                    .unwrap()
                    .scalar("w_reg", 2.0)
                    .unwrap();
                black_box(state.solve(&mut plan, &mut params, &solver).unwrap());
            });
        });
    }
    group.finish();
}

/// The cost evaluator alone, which is what every LM trial step pays for.
fn current_cost(c: &mut Criterion) {
    let txt = test_case("smoothing.lsq");
    let side = 512;
    let state = State::new(InitParams::default()).unwrap();
    let problem = state.define_source(&txt, SolverKind::GaussNewton).unwrap();
    let mut plan = state.plan(&problem, &[side, side]).unwrap();
    let data = noisy_image(side as usize, side as usize);
    let mut x = data.clone();
    let mut params = ProblemParams::new(&problem);
    params
        .unknown("X", &mut x)
        .unwrap()
        .image("A", &data)
        .unwrap()
        .scalar("w_fit", 1.0)
        .unwrap()
        .scalar("w_reg", 2.0)
        .unwrap();
    state
        .init(&mut plan, &params, &SolverParams::default())
        .unwrap();
    c.bench_function("current_cost_512x512", |b| {
        b.iter(|| black_box(state.current_cost(&plan).unwrap()));
    });
}

fn solve_rosenbrock(c: &mut Criterion) {
    let txt = test_case("rosenbrock.lsq");
    let state = State::new(InitParams::default().with_double_precision(true)).unwrap();
    let problem = state
        .define_source(&txt, SolverKind::LevenbergMarquardt)
        .unwrap();
    let mut plan = state.plan(&problem, &[1]).unwrap();
    let solver = SolverParams::default().with_outer_iterations(100);
    c.bench_function("solve_rosenbrock", |b| {
        b.iter(|| {
            let (mut x, mut y) = ([-1.2], [1.0]);
            let mut params = ProblemParams::new(&problem);
            params
                .unknown("x", &mut x)
                .unwrap()
                .unknown("y", &mut y)
                .unwrap();
            black_box(state.solve(&mut plan, &mut params, &solver).unwrap());
        });
    });
}

criterion_group!(benches, solve_smoothing, current_cost, solve_rosenbrock);
criterion_main!(benches);
