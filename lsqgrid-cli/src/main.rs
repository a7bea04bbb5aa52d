use std::{
    hint::black_box,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::{Context, bail};
use clap::Parser;
use lsqgrid::{
    FreedomAnalysis, InitParams, KernelTimings, ParamKind, Plan, Problem, ProblemParams,
    SolveSummary, SolverKind, SolverParams, State, StepOutcome, Warning,
};

mod plot;

#[derive(Parser)]
#[command(name = "lsqgrid", version, about, long_about = None)]
struct Cli {
    /// Path to the problem file.
    /// Use '-' for stdin.
    #[arg(short = 'f', long)]
    filepath: PathBuf,

    /// Size of each declared dimension, in declaration order, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    dims: Vec<u32>,

    /// Outer loop: 'gaussNewtonGPU' or 'LMGPU'.
    #[arg(long, default_value = "gaussNewtonGPU")]
    solver: SolverKind,

    /// Bind a parameter: NAME=NUMBER, or NAME=@PATH to read whitespace separated
    /// numbers from a file. Graph files have one edge per line.
    /// Unknowns that aren't given start at zero.
    #[arg(short = 'p', long = "param")]
    params: Vec<ParamArg>,

    /// Solve in double precision.
    #[arg(long)]
    double: bool,

    /// Log every iteration.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Show how long each kernel took.
    #[arg(long)]
    timing: bool,

    /// Maximum outer iterations.
    #[arg(long)]
    iterations: Option<usize>,

    /// Maximum inner (PCG) iterations per outer iteration.
    #[arg(long = "inner-iterations")]
    inner_iterations: Option<usize>,

    /// Write the solved unknowns to this file.
    #[arg(short = 'o', long)]
    out: Option<PathBuf>,

    /// Print the results as JSON instead of text.
    #[arg(long)]
    json: bool,

    /// Save a plot of the cost per iteration as a PNG.
    #[arg(long = "plot-cost")]
    plot_cost: Option<PathBuf>,

    /// Save the residual magnitudes of a grid term as a PNG.
    #[arg(long = "residual-png")]
    residual_png: Option<PathBuf>,

    /// Which term to draw with --residual-png.
    #[arg(long = "residual-term", default_value_t = 0)]
    residual_term: usize,

    /// Check the solved problem for directions the energy doesn't constrain.
    #[arg(long)]
    analyze: bool,

    /// Also time this many solves from the same starting point.
    #[arg(long)]
    bench: Option<u32>,
}

impl Cli {
    fn chart_name(&self) -> String {
        if self.filepath.display().to_string() == "-" {
            "lsqgrid".to_owned()
        } else {
            self.filepath.display().to_string()
        }
    }

    fn init_params(&self) -> InitParams {
        InitParams::default()
            .with_double_precision(self.double)
            .with_verbosity(u8::from(self.verbose))
            .with_kernel_timing(self.timing)
    }

    fn solver_params(&self) -> SolverParams {
        let mut solver = SolverParams::default();
        if let Some(n) = self.iterations {
            solver = solver.with_outer_iterations(n);
        }
        if let Some(n) = self.inner_iterations {
            solver = solver.with_inner_iterations(n);
        }
        solver
    }
}

/// One `--param` argument.
#[derive(Debug, Clone, PartialEq)]
struct ParamArg {
    name: String,
    value: ParamValue,
}

#[derive(Debug, Clone, PartialEq)]
enum ParamValue {
    Number(f64),
    File(PathBuf),
}

impl FromStr for ParamArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((name, value)) = s.split_once('=') else {
            return Err(format!("expected NAME=VALUE, found '{s}'"));
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(format!("missing parameter name in '{s}'"));
        }
        let value = match value.trim().strip_prefix('@') {
            Some(path) => ParamValue::File(PathBuf::from(path)),
            None => ParamValue::Number(
                value
                    .trim()
                    .parse()
                    .map_err(|e| format!("'{value}' is not a number: {e}"))?,
            ),
        };
        Ok(Self {
            name: name.to_owned(),
            value,
        })
    }
}

/// Owned data for every parameter the problem declares.
#[derive(Debug, Clone, Default)]
struct Inputs {
    unknowns: Vec<(String, Vec<f64>)>,
    images: Vec<(String, Vec<f64>)>,
    scalars: Vec<(String, f64)>,
    graphs: Vec<(String, Vec<Vec<u32>>)>,
}

impl Inputs {
    fn load(problem: &Problem, plan: &Plan, args: &[ParamArg]) -> anyhow::Result<Self> {
        for arg in args {
            if problem.schema().kind(&arg.name).is_none() {
                bail!("the problem has no parameter named '{}'", arg.name);
            }
        }
        let mut inputs = Self::default();
        for (name, kind) in problem.schema().iter() {
            // Later arguments win.
            let given = args.iter().rev().find(|a| a.name == name).map(|a| &a.value);
            let len = plan.param_len(name).unwrap_or_default();
            match (kind, given) {
                (ParamKind::Unknown, None) => inputs.unknowns.push((name.to_owned(), vec![0.0; len])),
                (ParamKind::Unknown, Some(v)) => {
                    inputs.unknowns.push((name.to_owned(), read_array(name, v, len)?));
                }
                (ParamKind::Image, Some(v)) => {
                    inputs.images.push((name.to_owned(), read_array(name, v, len)?));
                }
                (ParamKind::Scalar, Some(ParamValue::Number(v))) => {
                    inputs.scalars.push((name.to_owned(), *v));
                }
                (ParamKind::Scalar, Some(ParamValue::File(_))) => {
                    bail!("'{name}' is a scalar, give it a number rather than a file");
                }
                (ParamKind::Graph, Some(ParamValue::File(path))) => {
                    let arity = problem.graph_endpoints(name).map_or(0, <[String]>::len);
                    inputs.graphs.push((name.to_owned(), read_graph(path, arity)?));
                }
                (ParamKind::Graph, Some(ParamValue::Number(_))) => {
                    bail!("'{name}' is a graph, give it a file of edges with --param {name}=@PATH");
                }
                (_, None) => bail!("missing --param {name}=..."),
            }
        }
        Ok(inputs)
    }

    /// Bind everything, unknowns mutably so the solver can write them back.
    fn bind<'a>(&'a mut self, problem: &Problem) -> anyhow::Result<ProblemParams<'a>> {
        let mut params = ProblemParams::new(problem);
        for (name, values) in &mut self.unknowns {
            params.unknown(name, values)?;
        }
        for (name, values) in &self.images {
            params.image(name, values)?;
        }
        for (name, value) in &self.scalars {
            params.scalar(name, *value)?;
        }
        for (name, endpoints) in &self.graphs {
            let endpoints: Vec<&[u32]> = endpoints.iter().map(Vec::as_slice).collect();
            params.graph(name, &endpoints)?;
        }
        Ok(params)
    }
}

fn read_array(name: &str, value: &ParamValue, len: usize) -> anyhow::Result<Vec<f64>> {
    match value {
        ParamValue::Number(v) => Ok(vec![*v; len]),
        ParamValue::File(path) => {
            let txt = read_file(path)?;
            txt.split_whitespace()
                .map(|word| {
                    word.parse::<f64>()
                        .with_context(|| format!("'{word}' in the data for {name} is not a number"))
                })
                .collect()
        }
    }
}

/// One edge per line, one index per endpoint.
fn read_graph(path: &Path, arity: usize) -> anyhow::Result<Vec<Vec<u32>>> {
    let txt = read_file(path)?;
    let mut endpoints = vec![Vec::new(); arity];
    for (i, line) in txt.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indices = line
            .split_whitespace()
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("{}:{}: bad index", path.display(), i + 1))?;
        if indices.len() != arity {
            bail!(
                "{}:{}: expected {arity} indices per edge, found {}",
                path.display(),
                i + 1,
                indices.len()
            );
        }
        for (column, index) in endpoints.iter_mut().zip(indices) {
            column.push(index);
        }
    }
    Ok(endpoints)
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))
}

struct Solved {
    summary: SolveSummary,
    unknowns: Vec<(String, Vec<f64>)>,
    warnings: Vec<Warning>,
    num_residuals: usize,
    num_unknowns: usize,
    timings: Option<KernelTimings>,
    analysis: Option<FreedomAnalysis>,
    bench: Option<(u32, Duration)>,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let solved = match main_inner(&cli) {
        Ok(solved) => solved,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = handle_output(&solved, &cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    if !solved.summary.converged() {
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .init();
}

fn main_inner(cli: &Cli) -> anyhow::Result<Solved> {
    let problem_txt = read_problem(cli)?;
    let state = State::new(cli.init_params())?;
    let problem = state.define_source(&problem_txt, cli.solver)?;
    let mut plan = state.plan(&problem, &cli.dims)?;
    let mut inputs = Inputs::load(&problem, &plan, &cli.params)?;
    let starting_point = cli.bench.map(|_| inputs.clone());
    let solver = cli.solver_params();

    let summary = {
        let mut params = inputs.bind(&problem)?;
        state.solve(&mut plan, &mut params, &solver)?
    };
    let timings = plan.kernel_timings().cloned();

    if let Some(path) = &cli.residual_png {
        let image = state.residual_image(&plan, cli.residual_term)?;
        image
            .save(path)
            .with_context(|| format!("could not save {}", path.display()))?;
    }
    let analysis = if cli.analyze {
        Some(state.analyze(&plan)?)
    } else {
        None
    };

    // It ran. Benchmark its perf.
    let bench = match (cli.bench, starting_point) {
        (Some(n), Some(start)) if n > 0 => {
            let now = Instant::now();
            for _ in 0..n {
                let mut inputs = start.clone();
                let mut params = inputs.bind(&problem)?;
                black_box(state.solve(&mut plan, &mut params, &solver)?);
            }
            Some((n, now.elapsed() / n))
        }
        _ => None,
    };

    Ok(Solved {
        summary,
        unknowns: inputs.unknowns,
        warnings: problem.warnings().to_vec(),
        num_residuals: plan.num_residuals(),
        num_unknowns: plan.num_unknowns(),
        timings,
        analysis,
        bench,
    })
}

fn handle_output(solved: &Solved, cli: &Cli) -> anyhow::Result<()> {
    if cli.json {
        print_json(solved)?;
    } else {
        print_output(solved);
    }
    if let Some(path) = &cli.out {
        save_unknowns(path, &solved.unknowns)?;
    }
    if let Some(path) = &cli.plot_cost {
        plot::save_cost_png(&cli.chart_name(), &solved.summary, path)?;
    }
    Ok(())
}

fn print_json(solved: &Solved) -> anyhow::Result<()> {
    let unknowns: serde_json::Map<String, serde_json::Value> = solved
        .unknowns
        .iter()
        .map(|(name, values)| (name.clone(), serde_json::json!(values)))
        .collect();
    let report = serde_json::json!({
        "summary": solved.summary,
        "unknowns": unknowns,
        "warnings": solved.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "kernel_timings": solved.timings,
        "analysis": solved.analysis,
        "bench_mean_micros": solved.bench.map(|(_, mean)| mean.as_micros()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// One line per unknown array: its name, then its values.
fn save_unknowns(path: &Path, unknowns: &[(String, Vec<f64>)]) -> anyhow::Result<()> {
    let mut txt = String::new();
    for (name, values) in unknowns {
        txt.push_str(name);
        for v in values {
            txt.push(' ');
            txt.push_str(&v.to_string());
        }
        txt.push('\n');
    }
    std::fs::write(path, txt).with_context(|| format!("could not write {}", path.display()))
}

/// Prints the output nicely to stdout.
fn print_output(solved: &Solved) {
    use colored::Colorize;
    let Solved {
        summary,
        unknowns,
        warnings,
        num_residuals,
        num_unknowns,
        timings,
        analysis,
        bench,
    } = solved;
    print_warnings(warnings);
    print_problem_size(*num_residuals, *num_unknowns);
    println!("Iterations needed: {}", summary.iterations);
    println!(
        "Cost: {:.6e} -> {:.6e}",
        summary.initial_cost, summary.final_cost
    );
    match &summary.outcome {
        StepOutcome::Converged(reason) => println!("{}: {reason}", "Converged".green()),
        StepOutcome::Failed(e) => {
            eprintln!("{}: {e}", "Could not solve".red());
            if summary.history.is_empty() {
                eprintln!("Check your starting values: the first step already broke down.");
            } else {
                eprintln!("Try double precision, or more damping retries.");
            }
        }
        StepOutcome::Continue => println!("Stopped"),
    }
    for (name, values) in unknowns {
        if values.len() <= 8 {
            let shown: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
            println!("\t{name} = [{}]", shown.join(", "));
        } else {
            println!("\t{name}: {} values", values.len());
        }
    }
    if let Some(timings) = timings {
        println!("Kernel timings:\n{timings}");
    }
    if let Some(analysis) = analysis {
        print_analysis(analysis);
    }
    if let Some((n, mean)) = bench {
        print_performance(*n, *mean);
    }
}

fn print_analysis(analysis: &FreedomAnalysis) {
    use colored::Colorize;
    println!(
        "Rank {} of {}, condition number {:.3e}",
        analysis.rank,
        analysis.rank + analysis.degrees_of_freedom,
        analysis.condition_number
    );
    if analysis.is_underconstrained() {
        let l = format!("{} degrees of freedom left", analysis.degrees_of_freedom);
        println!("{}", l.yellow());
        for element in &analysis.underconstrained {
            println!("\t{}[{}]", element.array, element.index);
        }
    }
}

fn print_performance(n: u32, duration: Duration) {
    use colored::Colorize;
    let time = format!("{}μs", duration.as_micros());
    println!("Solved in {time} (mean over {n} solves)");
    let solves_per_second = Duration::from_secs(1).as_micros() / duration.as_micros().max(1);
    let solves_per_second = if solves_per_second <= 60 {
        solves_per_second.to_string().red()
    } else {
        solves_per_second.to_string().normal()
    };
    println!("i.e. {solves_per_second} solves per second");
}

fn print_warnings(warnings: &[Warning]) {
    use colored::Colorize;
    if !warnings.is_empty() {
        println!("Warnings:");
        for warning in warnings {
            println!("\t{}", warning.to_string().yellow());
        }
    }
}

fn print_problem_size(num_residuals: usize, num_unknowns: usize) {
    use colored::Colorize;
    print!("Problem size: ");
    let l = format!("{num_residuals} residuals, {num_unknowns} unknowns");
    if num_residuals < num_unknowns {
        println!("{}", l.yellow());
    } else {
        println!("{l}");
    }
}

/// Read the problem text from a file or stdin, depending on user args.
fn read_problem(cli: &Cli) -> anyhow::Result<String> {
    if cli.filepath != Path::new("-") {
        return read_file(&cli.filepath);
    }
    let mut problem_txt = String::with_capacity(256);
    io::stdin()
        .read_to_string(&mut problem_txt)
        .context("could not read stdin")?;
    Ok(problem_txt)
}

#[cfg(test)]
mod tests {
    use std::process::{Command, Stdio};

    use super::*;

    fn args(file: &str, dims: Vec<u32>, params: &[&str]) -> Cli {
        Cli {
            filepath: format!("../test_cases/{file}").into(),
            dims,
            solver: SolverKind::GaussNewton,
            params: params.iter().map(|p| p.parse().unwrap()).collect(),
            double: true,
            verbose: false,
            timing: false,
            iterations: None,
            inner_iterations: None,
            out: None,
            json: false,
            plot_cost: None,
            residual_png: None,
            residual_term: 0,
            analyze: false,
            bench: None,
        }
    }

    #[test]
    fn param_args() {
        assert_eq!(
            "w=2.5".parse::<ParamArg>().unwrap(),
            ParamArg {
                name: "w".to_owned(),
                value: ParamValue::Number(2.5)
            }
        );
        assert_eq!(
            "A=@data.txt".parse::<ParamArg>().unwrap().value,
            ParamValue::File("data.txt".into())
        );
        assert!("w".parse::<ParamArg>().is_err());
        assert!("=1".parse::<ParamArg>().is_err());
        assert!("w=abc".parse::<ParamArg>().is_err());
    }

    #[test]
    fn test_curve_fit_inner() {
        let mut cli = args(
            "curve_fit.lsq",
            vec![10],
            &["data=@../test_cases/curve_fit_data.txt"],
        );
        cli.analyze = true;
        cli.timing = true;
        cli.bench = Some(2);
        let solved = main_inner(&cli).unwrap();
        assert!(solved.summary.converged());
        let (name, offset) = &solved.unknowns[0];
        assert_eq!(name, "offset");
        assert!((offset[0] - 4.8136).abs() < 1e-9, "{offset:?}");
        let analysis = solved.analysis.as_ref().unwrap();
        assert_eq!(analysis.rank, 1);
        assert!(!analysis.is_underconstrained());
        assert!(!solved.timings.as_ref().unwrap().is_empty());
        assert_eq!(solved.bench.unwrap().0, 2);
        handle_output(&solved, &cli).unwrap();
    }

    #[test]
    fn test_springs_inner() {
        let mut cli = args(
            "springs.lsq",
            vec![16, 24],
            &[
                "Px=@../test_cases/springs_ax.txt",
                "Py=@../test_cases/springs_ay.txt",
                "Ax=@../test_cases/springs_ax.txt",
                "Ay=@../test_cases/springs_ay.txt",
                "rest=@../test_cases/springs_rest.txt",
                "stiffness=1",
                "pin=0.1",
                "G=@../test_cases/springs_edges.txt",
            ],
        );
        cli.solver = SolverKind::LevenbergMarquardt;
        let solved = main_inner(&cli).unwrap();
        assert_eq!(solved.num_unknowns, 32);
        assert!(solved.summary.final_cost < solved.summary.initial_cost);
    }

    #[test]
    fn missing_params_are_reported() {
        let cli = args("curve_fit.lsq", vec![10], &[]);
        let err = main_inner(&cli).err().unwrap();
        assert!(err.to_string().contains("data"), "{err}");

        let cli = args("curve_fit.lsq", vec![10], &["nope=1", "data=1"]);
        let err = main_inner(&cli).err().unwrap();
        assert!(err.to_string().contains("nope"), "{err}");
    }

    #[test]
    fn graph_files_need_one_index_per_endpoint() {
        let edges = std::env::temp_dir().join("lsqgrid_cli_bad_edges.txt");
        std::fs::write(&edges, "0 1\n2\n").unwrap();
        let err = read_graph(&edges, 2).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
        std::fs::write(&edges, "0 1\n\n2 3\n").unwrap();
        assert_eq!(read_graph(&edges, 2).unwrap(), vec![vec![0, 2], vec![1, 3]]);
        let _ = std::fs::remove_file(edges);
    }

    #[test]
    fn test_curve_fit() {
        let out = Command::new("cargo")
            .args([
                "run",
                "--quiet",
                "--",
                "-f",
                "../test_cases/curve_fit.lsq",
                "--dims",
                "10",
                "--param",
                "data=@../test_cases/curve_fit_data.txt",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
            .wait_with_output()
            .unwrap();
        assert!(out.status.success());
        let stdout = String::from_utf8(out.stdout).unwrap();
        assert!(stdout.contains("Problem size: 10 residuals, 1 unknowns"));
    }
}
