//! Jacobi-preconditioned conjugate gradients on the damped normal equations.

use rayon::prelude::*;

use crate::{
    plan::PcgBuffers,
    real::Real,
    reduce::{axpy, dot, fill, mul_into, scale_neg, sum_sq, xpby},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PcgStats {
    pub(crate) iterations: usize,
    /// `|r| / |b|` when the solve stopped.
    pub(crate) relative_residual: f64,
}

/// `1 / (diag + lambda)`, with 1 wherever that would divide by zero.
pub(crate) fn precondition<R: Real>(out: &mut [R], diagonal: &[R], lambda: R) {
    out.par_iter_mut()
        .zip(diagonal.par_iter())
        .for_each(|(out, &d)| {
            let shifted = d + lambda;
            *out = if shifted > R::zero() {
                shifted.recip()
            } else {
                R::one()
            };
        });
}

/// Solve `A delta = -gradient` starting from `delta = 0`, leaving the result in
/// `buffers.delta`. `apply(p, out)` must write `A p` into `out`, and `A` must be
/// symmetric positive semi-definite. The preconditioner must already be filled in.
pub(crate) fn solve<R, A>(
    mut apply: A,
    gradient: &[R],
    buffers: &mut PcgBuffers<R>,
    max_iterations: usize,
    tolerance: f64,
) -> PcgStats
where
    R: Real,
    A: FnMut(&[R], &mut [R]),
{
    let PcgBuffers {
        delta,
        r,
        z,
        p,
        ap,
        preconditioner,
    } = buffers;
    fill(delta, R::zero());
    scale_neg(r, gradient);
    let b_norm = sum_sq(r).sqrt();
    let mut stats = PcgStats {
        iterations: 0,
        relative_residual: 0.0,
    };
    if b_norm == R::zero() {
        return stats;
    }
    stats.relative_residual = 1.0;

    mul_into(z, preconditioner, r);
    p.copy_from_slice(z);
    let mut rz = dot(r, z);
    for k in 0..max_iterations {
        apply(p, ap);
        let pap = dot(p, ap);
        // No further progress is possible along p.
        if pap.is_nan() || pap <= R::zero() {
            break;
        }
        let alpha = rz / pap;
        axpy(delta, alpha, p);
        axpy(r, -alpha, ap);
        stats.iterations = k + 1;
        stats.relative_residual = (sum_sq(r).sqrt() / b_norm).widen();
        if stats.relative_residual <= tolerance {
            break;
        }
        mul_into(z, preconditioner, r);
        let rz_next = dot(r, z);
        xpby(p, z, rz_next / rz);
        rz = rz_next;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffers(n: usize) -> PcgBuffers<f64> {
        PcgBuffers {
            delta: vec![0.0; n],
            r: vec![0.0; n],
            z: vec![0.0; n],
            p: vec![0.0; n],
            ap: vec![0.0; n],
            preconditioner: vec![0.0; n],
        }
    }

    /// Dense symmetric matrix-vector product, row-major.
    fn matvec(a: &[f64], n: usize) -> impl FnMut(&[f64], &mut [f64]) + '_ {
        move |p, out| {
            for (i, out) in out.iter_mut().enumerate() {
                *out = (0..n).map(|j| a[i * n + j] * p[j]).sum();
            }
        }
    }

    #[test]
    fn solves_spd_system() {
        let a = [4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0];
        let diagonal = [4.0, 3.0, 2.0];
        // A x = b with x = [1, -2, 3]
        let gradient = [-2.0, 2.0, -4.0];
        let mut bufs = buffers(3);
        precondition(&mut bufs.preconditioner, &diagonal, 0.0);
        let stats = solve(matvec(&a, 3), &gradient, &mut bufs, 10, 1e-12);
        assert!(stats.iterations <= 3);
        assert!(stats.relative_residual <= 1e-12);
        for (got, want) in bufs.delta.iter().zip([1.0, -2.0, 3.0]) {
            assert!((got - want).abs() < 1e-10, "{got} vs {want}");
        }
    }

    #[test]
    fn zero_gradient_is_zero_step() {
        let a = [1.0];
        let mut bufs = buffers(1);
        bufs.delta[0] = 7.0;
        let stats = solve(matvec(&a, 1), &[0.0], &mut bufs, 10, 1e-6);
        assert_eq!(stats.iterations, 0);
        assert_eq!(bufs.delta, vec![0.0]);
    }

    #[test]
    fn stops_at_iteration_cap() {
        let n = 20;
        let mut a = vec![0.0; n * n];
        for i in 0..n {
            a[i * n + i] = 2.0 + i as f64;
            if i + 1 < n {
                a[i * n + i + 1] = -1.0;
                a[(i + 1) * n + i] = -1.0;
            }
        }
        let gradient: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
        let mut bufs = buffers(n);
        bufs.preconditioner.fill(1.0);
        let stats = solve(matvec(&a, n), &gradient, &mut bufs, 2, 0.0);
        assert_eq!(stats.iterations, 2);
        assert!(stats.relative_residual > 0.0);
    }

    #[test]
    fn zero_diagonal_preconditions_to_one() {
        let mut out = [0.0; 3];
        precondition(&mut out, &[0.0, 4.0, 1.0], 0.0);
        assert_eq!(out, [1.0, 0.25, 1.0]);
        precondition(&mut out, &[0.0, 4.0, 1.0], 1.0);
        assert_eq!(out, [1.0, 0.2, 0.5]);
    }
}
