//! Dense diagnostics of the linearized system at the current unknowns.
//! Only practical for small plans: the whole Jacobian is materialized.

use faer::Mat;
use serde::Serialize;

use crate::{
    error::AnalysisError,
    plan::{PlanLayout, Workspace},
    real::Real,
    solver::engine::{Kernels, Linearization},
};

/// Plans with more unknowns than this can't be analyzed.
pub const MAX_DENSE_UNKNOWNS: usize = 2048;
/// Plans whose dense Jacobian has more entries than this can't be analyzed.
pub const MAX_DENSE_ENTRIES: usize = 1 << 24;

/// How well the energy pins down the unknowns, near their current values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FreedomAnalysis {
    /// Numerical rank of the Jacobian.
    pub rank: usize,
    /// Unknowns minus rank. Directions the energy doesn't see.
    pub degrees_of_freedom: usize,
    /// Singular values of the Jacobian, largest first.
    pub singular_values: Vec<f64>,
    /// Largest over smallest singular value. Infinite if the Jacobian is rank deficient.
    pub condition_number: f64,
    /// Unknown elements which move along some free direction.
    pub underconstrained: Vec<UnknownElement>,
}

impl FreedomAnalysis {
    /// True if some direction of the unknowns doesn't change the energy.
    pub fn is_underconstrained(&self) -> bool {
        self.degrees_of_freedom > 0
    }
}

/// One element of an unknown array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownElement {
    /// Array name.
    pub array: String,
    /// Linear index, first dimension fastest.
    pub index: usize,
}

pub(crate) fn analyze<R: Real>(
    kernels: &Kernels<'_>,
    ws: &Workspace<R>,
) -> Result<FreedomAnalysis, AnalysisError> {
    let layout = kernels.layout;
    let (m, n) = (layout.n_residuals, layout.n_unknowns);
    let too_large = AnalysisError::TooLarge {
        rows: m,
        unknowns: n,
        max_unknowns: MAX_DENSE_UNKNOWNS,
        max_entries: MAX_DENSE_ENTRIES,
    };
    if n > MAX_DENSE_UNKNOWNS {
        return Err(too_large);
    }
    match m.checked_mul(n) {
        Some(entries) if entries <= MAX_DENSE_ENTRIES => {}
        _ => return Err(too_large),
    }

    // J e_c, one column at a time.
    let mut linearization = Linearization::new(kernels, ws);
    let mut j_dense = Mat::<f64>::zeros(m, n);
    for c in 0..n {
        for (row, value) in linearization.column(kernels, ws, c).into_iter().enumerate() {
            j_dense[(row, c)] = value;
        }
    }

    // SVD decomposes `J` into `J = UΣVᵀ`.
    let svd = j_dense.svd().map_err(AnalysisError::FaerSvd)?;
    let singular_values: Vec<f64> = svd.S().column_vector().iter().copied().collect();

    // Same rank-revealing cutoff LAPACK recommends.
    let largest = singular_values.iter().copied().fold(0.0, libm::fmax);
    let tolerance = f64::EPSILON * (m.max(n) as f64) * largest;
    let rank = singular_values.iter().filter(|&&s| s > tolerance).count();
    let degrees_of_freedom = n - rank;
    let condition_number = if rank < n {
        f64::INFINITY
    } else {
        largest / singular_values.iter().copied().fold(f64::INFINITY, libm::fmin)
    };

    // An unknown is underconstrained if it has weight in the null space of J,
    // which is spanned by the trailing columns of V.
    let v = svd.V();
    let participation: Vec<f64> = (0..n)
        .map(|j| {
            (rank..n)
                .map(|k| {
                    // V[j, k] is the component of unknown j along the k-th free direction.
                    let v_jk = v.get(j, k);
                    v_jk * v_jk
                })
                .sum::<f64>()
                .sqrt()
        })
        .collect();
    let max_participation = participation.iter().copied().fold(0.0, libm::fmax);
    let noise_floor = 10.0 * libm::sqrt(n as f64) * f64::EPSILON;
    let threshold = libm::fmax(1e-3 * max_participation, noise_floor);
    let underconstrained = (0..n)
        .filter(|&j| participation[j] > threshold)
        .filter_map(|j| element(kernels, layout, j))
        .collect();

    Ok(FreedomAnalysis {
        rank,
        degrees_of_freedom,
        singular_values,
        condition_number,
        underconstrained,
    })
}

/// Which array element an index into the unknown mirror is.
fn element(kernels: &Kernels<'_>, layout: &PlanLayout, j: usize) -> Option<UnknownElement> {
    layout
        .arrays
        .iter()
        .zip(&kernels.problem.arrays)
        .find(|(array, _)| array.unknown && (array.offset..array.offset + array.len).contains(&j))
        .map(|(array, decl)| UnknownElement {
            array: decl.name.clone(),
            index: j - array.offset,
        })
}
