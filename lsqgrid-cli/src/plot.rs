use std::path::Path;

use lsqgrid::SolveSummary;
use plotters::{coord::types::RangedCoordf64, prelude::*};

const COST_COLOR: RGBColor = RGBColor(0x58, 0x50, 0x8d);
const REJECTED_COLOR: RGBColor = RGBColor(0xff, 0x63, 0x61);

const LABEL_STYLE: (&str, i32) = ("sans-serif", 30);

/// Costs of zero can't go on a log axis.
const COST_FLOOR: f64 = 1e-300;

type Chart<'a, DB> = ChartContext<'a, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

/// Plot log10 of the cost after Init and after every iteration.
/// Iterations which rejected some damping trials are marked.
pub fn save_cost_png(chart_name: &str, summary: &SolveSummary, output_path: &Path) -> anyhow::Result<()> {
    let costs = costs(summary);
    let bounds = Bounds::new(&costs);

    let width = 800;
    let height = 600;
    let dpi_scale = 2;
    let root = BitMapBackend::new(output_path, (width * dpi_scale, height * dpi_scale))
        .into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(80)
        .caption(chart_name, ("sans-serif", 50))
        .build_cartesian_2d(bounds.min_x..bounds.max_x, bounds.min_y..bounds.max_y)?;

    draw_axes(&mut chart)?;
    draw_costs(&mut chart, &costs)?;

    let rejected: Vec<(f64, f64)> = summary
        .history
        .iter()
        .zip(costs.iter().skip(1))
        .filter(|(stats, _)| stats.rejected > 0)
        .map(|(_, point)| *point)
        .collect();
    chart.draw_series(PointSeries::of_element(
        rejected,
        8,
        &REJECTED_COLOR,
        &|coord, size, style| EmptyElement::at(coord) + Circle::new((0, 0), size, style.filled()),
    ))?;

    root.present()?;
    println!("Cost plot saved to {}", output_path.display());
    Ok(())
}

/// (iteration, log10 cost), starting with the cost after Init.
fn costs(summary: &SolveSummary) -> Vec<(f64, f64)> {
    std::iter::once(summary.initial_cost)
        .chain(summary.history.iter().map(|stats| stats.cost_after))
        .enumerate()
        .map(|(i, cost)| (i as f64, cost.max(COST_FLOOR).log10()))
        .collect()
}

/// Span of the chart area
struct Bounds {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
}

impl Bounds {
    fn new(costs: &[(f64, f64)]) -> Self {
        let padding = 0.5;
        let ys = costs.iter().map(|(_, y)| *y).filter(|y| y.is_finite());
        let min_y = ys.clone().reduce(f64::min).unwrap_or(0.0) - padding;
        let max_y = ys.reduce(f64::max).unwrap_or(0.0) + padding;
        let max_x = costs.last().map_or(1.0, |(x, _)| x.max(1.0));
        Self {
            min_x: 0.0,
            max_x,
            min_y,
            max_y,
        }
    }
}

fn draw_axes<DB: DrawingBackend>(chart: &mut Chart<'_, DB>) -> anyhow::Result<()>
where
    <DB as plotters::prelude::DrawingBackend>::ErrorType: 'static,
{
    chart
        .configure_mesh()
        .x_desc("iteration")
        .y_desc("log10 cost")
        .label_style(LABEL_STYLE)
        .axis_desc_style(LABEL_STYLE)
        .draw()?;
    Ok(())
}

fn draw_costs<DB: DrawingBackend>(chart: &mut Chart<'_, DB>, costs: &[(f64, f64)]) -> anyhow::Result<()>
where
    <DB as plotters::prelude::DrawingBackend>::ErrorType: 'static,
{
    let finite: Vec<(f64, f64)> = costs.iter().copied().filter(|(_, y)| y.is_finite()).collect();
    chart.draw_series(LineSeries::new(finite.clone(), COST_COLOR.stroke_width(3)))?;
    chart.draw_series(PointSeries::of_element(
        finite,
        5,
        &COST_COLOR,
        &|coord, size, style| EmptyElement::at(coord) + Circle::new((0, 0), size, style.filled()),
    ))?;
    Ok(())
}
