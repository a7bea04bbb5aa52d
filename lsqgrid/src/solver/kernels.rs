//! Data-parallel kernels. Each one runs over the work items of a single term
//! (or the elements of a single unknown array) and writes a disjoint output range.

use rayon::prelude::*;

use crate::{
    plan::{Gather, Incidence, TermLayout, Via},
    problem::EnergyTerm,
    real::Real,
    reduce,
};

/// What the residual and Jacobian kernels read.
pub(crate) struct Inputs<'a, R> {
    pub(crate) x: &'a [R],
    pub(crate) images: &'a [R],
    pub(crate) scalars: &'a [R],
    pub(crate) endpoints: &'a [Vec<Vec<u32>>],
}

impl<R: Real> Inputs<'_, R> {
    /// Load every value a term reads at one work item.
    #[inline]
    fn gather(&self, term: &TermLayout, item: usize, out: &mut [R]) {
        for (value, load) in out.iter_mut().zip(&term.loads) {
            let e = load.offset + load.element(item, self.endpoints);
            *value = if load.unknown {
                self.x[e]
            } else {
                self.images[e]
            };
        }
    }
}

#[inline]
fn active(mask: &[bool], item: usize) -> bool {
    mask.is_empty() || mask[item]
}

/// Tape stack and loaded values, reused across the items one worker handles.
fn scratch<R: Real>(term: &TermLayout) -> (Vec<R>, Vec<R>) {
    (
        Vec::with_capacity(term.max_stack),
        vec![R::zero(); term.loads.len()],
    )
}

/// One residual per work item. Inactive items get zero.
pub(crate) fn residuals<R: Real>(
    term: &TermLayout,
    code: &EnergyTerm,
    mask: &[bool],
    inputs: &Inputs<'_, R>,
    out: &mut [R],
) {
    out.par_iter_mut().enumerate().for_each_init(
        || scratch(term),
        |(stack, loads), (item, r)| {
            *r = if active(mask, item) {
                inputs.gather(term, item, loads);
                code.residual.eval(loads, inputs.scalars, stack)
            } else {
                R::zero()
            };
        },
    );
}

/// One row of partial derivatives per work item. Inactive items get a zero row.
pub(crate) fn jacobian<R: Real>(
    term: &TermLayout,
    code: &EnergyTerm,
    mask: &[bool],
    inputs: &Inputs<'_, R>,
    out: &mut [R],
) {
    let width = term.width();
    if width == 0 {
        return;
    }
    out.par_chunks_mut(width).enumerate().for_each_init(
        || scratch(term),
        |(stack, loads), (item, row)| {
            if !active(mask, item) {
                row.fill(R::zero());
                return;
            }
            inputs.gather(term, item, loads);
            for (j, partial) in row.iter_mut().zip(&code.partials) {
                *j = partial.tape.eval(loads, inputs.scalars, stack);
            }
        },
    );
}

/// Sum of squared residuals of one term, evaluated without storing them.
/// Adds up in the same order as [`reduce::sum_sq`] over the stored residuals,
/// so both give bit-identical costs.
pub(crate) fn term_cost<R: Real>(
    term: &TermLayout,
    code: &EnergyTerm,
    mask: &[bool],
    inputs: &Inputs<'_, R>,
) -> R {
    reduce::sum_by_init(
        term.items,
        || scratch(term),
        |(stack, loads), item| {
            if !active(mask, item) {
                return R::zero();
            }
            inputs.gather(term, item, loads);
            let r = code.residual.eval(loads, inputs.scalars, stack);
            r * r
        },
    )
}

/// `out = J p` over one term's rows.
pub(crate) fn apply_j<R: Real>(
    term: &TermLayout,
    mask: &[bool],
    jacobian: &[R],
    endpoints: &[Vec<Vec<u32>>],
    p: &[R],
    out: &mut [R],
) {
    let width = term.width();
    out.par_iter_mut().enumerate().for_each(|(item, out)| {
        *out = if width == 0 || !active(mask, item) {
            R::zero()
        } else {
            let row = &jacobian[item * width..(item + 1) * width];
            row.iter()
                .zip(&term.columns)
                .fold(R::zero(), |acc, (&j, &slot)| {
                    let load = &term.loads[slot];
                    acc + j * p[load.offset + load.element(item, endpoints)]
                })
        };
    });
}

/// Add one Jacobian column's transpose contribution to one unknown array:
/// `out[c] += weight(w, J[w, column])` for every work item `w` that read element `c`.
///
/// Each output element sums its own contributions in work-item order,
/// so no two workers ever write the same element.
pub(crate) fn gather_transpose<R, W>(
    gather: &Gather,
    term: &TermLayout,
    mask: &[bool],
    jacobian: &[R],
    incidence: &[Incidence],
    out: &mut [R],
    weight: W,
) where
    R: Real,
    W: Fn(usize, R) -> R + Sync,
{
    let width = term.width();
    let entry = |w: usize| weight(w, jacobian[w * width + gather.column]);
    match gather.via {
        Via::Shift(shift) => out.par_iter_mut().enumerate().for_each(|(c, out)| {
            let w = c as isize - shift;
            if w >= 0 && (w as usize) < term.items && active(mask, w as usize) {
                *out = *out + entry(w as usize);
            }
        }),
        Via::Broadcast => {
            let total = reduce::sum_by(term.items, |w| {
                if active(mask, w) { entry(w) } else { R::zero() }
            });
            if let Some(out) = out.first_mut() {
                *out = *out + total;
            }
        }
        Via::Incidence(i) => {
            let incidence = &incidence[i];
            out.par_iter_mut().enumerate().for_each(|(c, out)| {
                let edges = &incidence.edges[incidence.offsets[c]..incidence.offsets[c + 1]];
                let sum = edges
                    .iter()
                    .fold(R::zero(), |acc, &w| acc + entry(w as usize));
                *out = *out + sum;
            });
        }
    }
}
