//! Deterministic reductions and elementwise vector kernels.
//!
//! Every reduction splits its input into fixed blocks of [`BLOCK`] elements,
//! sums each block sequentially, then sums the block partials in block order.
//! The result only depends on the input, never on how many threads ran it.

use rayon::prelude::*;

use crate::real::Real;

/// Elements per reduction block.
pub(crate) const BLOCK: usize = 1024;

/// Sum `f(i)` for `i` in `0..len`, in a fixed order.
pub(crate) fn sum_by<R, F>(len: usize, f: F) -> R
where
    R: Real,
    F: Fn(usize) -> R + Sync,
{
    sum_by_init(len, || (), |_, i| f(i))
}

/// Like [`sum_by`], but each block gets its own scratch from `init`.
/// Adds up in exactly the same order as [`sum_by`].
pub(crate) fn sum_by_init<R, T, I, F>(len: usize, init: I, f: F) -> R
where
    R: Real,
    I: Fn() -> T + Sync,
    F: Fn(&mut T, usize) -> R + Sync,
{
    let partials: Vec<R> = (0..len.div_ceil(BLOCK))
        .into_par_iter()
        .map(|block| {
            let mut scratch = init();
            let start = block * BLOCK;
            let end = (start + BLOCK).min(len);
            (start..end).fold(R::zero(), |acc, i| acc + f(&mut scratch, i))
        })
        .collect();
    partials.into_iter().fold(R::zero(), |acc, p| acc + p)
}

pub(crate) fn dot<R: Real>(a: &[R], b: &[R]) -> R {
    debug_assert_eq!(a.len(), b.len());
    sum_by(a.len(), |i| a[i] * b[i])
}

pub(crate) fn sum_sq<R: Real>(a: &[R]) -> R {
    sum_by(a.len(), |i| a[i] * a[i])
}

/// Largest absolute value, or zero for an empty slice.
pub(crate) fn norm_inf<R: Real>(a: &[R]) -> R {
    a.par_iter()
        .map(|v| v.abs())
        .reduce(R::zero, |x, y| x.max(y))
}

pub(crate) fn all_finite<R: Real>(a: &[R]) -> bool {
    a.par_iter().all(|v| v.is_finite())
}

/// `y += alpha * x`
pub(crate) fn axpy<R: Real>(y: &mut [R], alpha: R, x: &[R]) {
    y.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(y, &x)| *y = *y + alpha * x);
}

/// `p = z + beta * p`
pub(crate) fn xpby<R: Real>(p: &mut [R], z: &[R], beta: R) {
    p.par_iter_mut()
        .zip(z.par_iter())
        .for_each(|(p, &z)| *p = z + beta * *p);
}

/// `out = x + y`
pub(crate) fn add_into<R: Real>(out: &mut [R], x: &[R], y: &[R]) {
    out.par_iter_mut()
        .zip(x.par_iter().zip(y.par_iter()))
        .for_each(|(out, (&x, &y))| *out = x + y);
}

/// `out = a * b` elementwise.
pub(crate) fn mul_into<R: Real>(out: &mut [R], a: &[R], b: &[R]) {
    out.par_iter_mut()
        .zip(a.par_iter().zip(b.par_iter()))
        .for_each(|(out, (&a, &b))| *out = a * b);
}

pub(crate) fn scale_neg<R: Real>(out: &mut [R], x: &[R]) {
    out.par_iter_mut()
        .zip(x.par_iter())
        .for_each(|(out, &x)| *out = -x);
}

pub(crate) fn fill<R: Real>(out: &mut [R], value: R) {
    out.par_iter_mut().for_each(|v| *v = value);
}
