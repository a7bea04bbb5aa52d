//! Residual field visualization for grid terms.
//!
//! Renders one term's residuals at the current unknowns as a grayscale image,
//! one pixel per work item: the first grid dimension runs left to right, every
//! other dimension stacks downwards. Useful as a sanity check on a solve:
//! structure left in the image is structure the unknowns haven't explained.

use crate::{
    error::MisuseError,
    plan::Workspace,
    problem::Domain,
    real::Real,
    solver::engine::{Kernels, term_residuals},
};

/// Pixels whose residual is below this fraction of the largest are drawn black.
const ZERO_RESIDUAL_THRESHOLD: f64 = 1e-3;

pub(crate) fn render<R: Real>(
    kernels: &Kernels<'_>,
    ws: &Workspace<R>,
    term: usize,
) -> Result<image::GrayImage, MisuseError> {
    let terms = kernels.problem.terms.len();
    let code = kernels
        .problem
        .terms
        .get(term)
        .ok_or(MisuseError::NoSuchTerm { term, terms })?;
    if matches!(code.domain, Domain::Graph(_)) {
        return Err(MisuseError::NotAGridTerm { term });
    }
    let layout = &kernels.layout.terms[term];
    let width = layout.extents.first().copied().unwrap_or(1);
    if layout.items == 0 || width == 0 {
        return Ok(image::GrayImage::new(0, 0));
    }
    let height = layout.items / width;

    let residuals = term_residuals(kernels, ws, term);
    let largest = residuals.iter().map(|r| r.abs()).fold(0.0, libm::fmax);
    let mut buf = image::GrayImage::new(width as u32, height as u32);
    for (item, r) in residuals.iter().enumerate() {
        let magnitude = if largest > 0.0 { r.abs() / largest } else { 0.0 };
        let intensity = if magnitude < ZERO_RESIDUAL_THRESHOLD {
            0
        } else {
            (magnitude * 255.0).round() as u8
        };
        let (px, py) = (item % width, item / width);
        buf.put_pixel(px as u32, py as u32, image::Luma([intensity]));
    }
    Ok(buf)
}
