#![no_main]

use arbitrary::Arbitrary;
use lsqgrid::{InitParams, SolverKind, State};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|setup: Setup| {
    let Ok(state) = State::new(InitParams::default().with_threads(1)) else {
        return;
    };
    let Ok(problem) = state.define_source(&setup.source, setup.kind) else {
        return;
    };
    // Small plans only, the point is to shake out the compiler and plan builder.
    let dims: Vec<u32> = setup.dims.iter().map(|d| u32::from(*d % 16)).collect();
    let _ = state.plan(&problem, &dims);
});

#[derive(Debug, Arbitrary)]
struct Setup {
    source: String,
    kind: SolverKind,
    dims: Vec<u8>,
}
