use faer::linalg::svd::SvdError;
use serde::Serialize;

/// Everything that can go wrong in lsqgrid.
/// Each variant wraps a more detailed error for that category.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum Error {
    /// The state or solver was configured with invalid settings.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The problem text could not be read or compiled.
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// Workspace memory could not be reserved.
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    /// Sizes given by the caller don't match what the problem declared.
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatchError),
    /// The iteration produced non-finite values or could not make progress.
    #[error(transparent)]
    NumericDivergence(#[from] NumericDivergenceError),
    /// The API was used in an order or combination it doesn't support.
    #[error(transparent)]
    Misuse(#[from] MisuseError),
    /// Dense analysis of the linearized system failed.
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// Invalid settings for a [`crate::State`] or a solve.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum ConfigurationError {
    /// Only verbosity levels 0 (quiet) and 1 (full) exist.
    #[error("Verbosity must be 0 or 1, but you gave {0}")]
    InvalidVerbosity(u8),
    /// A memory budget of zero bytes can't hold any plan.
    #[error("Device memory limit must be nonzero")]
    InvalidMemoryLimit,
    /// The worker pool for the device could not be started.
    #[error("Could not start the device thread pool: {0}")]
    DevicePool(String),
    /// A solver parameter was out of its valid range.
    #[error("Solver parameter {name} = {value} is invalid: {reason}")]
    InvalidSolverParam {
        /// Which parameter.
        name: &'static str,
        /// The value given.
        value: f64,
        /// What the parameter requires.
        reason: &'static str,
    },
}

/// Problem text could not be turned into a compiled problem.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum CompilationError {
    /// Problem file could not be read.
    #[error("Could not read problem file {path}: {reason}")]
    Io {
        /// The file which couldn't be read.
        path: String,
        /// Why.
        reason: String,
    },
    /// Solver kinds are `gaussNewtonGPU` and `LMGPU`.
    #[error("Unknown solver kind '{0}', expected 'gaussNewtonGPU' or 'LMGPU'")]
    UnknownSolverKind(String),
    /// The text is not valid syntax.
    #[error("Syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// Parser message.
        message: String,
    },
    /// A required section header was missing or out of order.
    #[error("Expected section '# {expected}' on line {line}")]
    MissingSection {
        /// Which section.
        expected: &'static str,
        /// Where it was expected.
        line: usize,
    },
    /// The same name was declared twice.
    #[error("'{name}' is declared more than once")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },
    /// A name was used but never declared, or declared as a different kind of thing.
    #[error("Line {line}: '{name}' is not a declared {expected}")]
    Undefined {
        /// 1-based line number.
        line: usize,
        /// The name that couldn't be resolved.
        name: String,
        /// What kind of declaration was expected.
        expected: &'static str,
    },
    /// An access doesn't fit the term's domain.
    #[error("Line {line}: {message}")]
    DomainMismatch {
        /// 1-based line number.
        line: usize,
        /// Human-readable explanation.
        message: String,
    },
    /// The construct parses but can't be compiled.
    #[error("Line {line}: unsupported: {message}")]
    Unsupported {
        /// 1-based line number.
        line: usize,
        /// Human-readable explanation.
        message: String,
    },
    /// A problem must declare something to solve for.
    #[error("The problem declares no unknowns")]
    NoUnknowns,
    /// A problem must have at least one energy term.
    #[error("The problem has no energy terms")]
    NoTerms,
}

/// Workspace memory could not be obtained.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum AllocationError {
    /// The plan needs more memory than the device budget has left.
    #[error(
        "Plan needs {requested} bytes but the device only has {available} bytes available"
    )]
    DeviceMemoryExhausted {
        /// Bytes the plan asked for.
        requested: usize,
        /// Bytes still free under the device budget.
        available: usize,
    },
    /// The host allocator refused a buffer.
    #[error("Could not allocate a buffer of {len} elements")]
    HostAllocation {
        /// Elements requested.
        len: usize,
    },
    /// The plan's size doesn't fit in the address space.
    #[error("Plan size overflows the address space")]
    SizeOverflow,
}

/// Sizes given by the caller don't match the problem.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum DimensionMismatchError {
    /// Wrong number of dimensions for the plan.
    #[error("Problem declares {expected} dimensions but the plan was given {actual}")]
    Arity {
        /// Declared dimensions.
        expected: usize,
        /// Given dimensions.
        actual: usize,
    },
    /// A bound buffer has the wrong number of elements.
    #[error("Parameter '{name}' needs {expected} elements but the buffer has {actual}")]
    BufferLength {
        /// Parameter name.
        name: String,
        /// Elements the plan needs.
        expected: usize,
        /// Elements the buffer holds.
        actual: usize,
    },
    /// A graph was bound with the wrong number of endpoint buffers.
    #[error("Graph '{name}' has {expected} endpoints but {actual} index buffers were bound")]
    GraphEndpoints {
        /// Graph name.
        name: String,
        /// Declared endpoints.
        expected: usize,
        /// Buffers given.
        actual: usize,
    },
    /// A graph edge points outside the array it indexes.
    #[error(
        "Graph '{graph}' edge {edge} has endpoint '{endpoint}' = {index}, but '{array}' only has {len} elements"
    )]
    GraphIndexOutOfBounds {
        /// Graph name.
        graph: String,
        /// Which edge.
        edge: usize,
        /// Which endpoint.
        endpoint: String,
        /// The offending index.
        index: u32,
        /// The array indexed through this endpoint.
        array: String,
        /// Length of that array.
        len: usize,
    },
}

/// The iteration diverged or stalled.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum NumericDivergenceError {
    /// A residual was NaN or infinite.
    #[error("Residuals became non-finite at iteration {iteration}")]
    NonFiniteResidual {
        /// Outer iteration where it happened.
        iteration: usize,
    },
    /// A Jacobian entry was NaN or infinite.
    #[error("Jacobian became non-finite at iteration {iteration}")]
    NonFiniteJacobian {
        /// Outer iteration where it happened.
        iteration: usize,
    },
    /// The linear solve produced a NaN or infinite update.
    #[error("Update became non-finite at iteration {iteration}")]
    NonFiniteUpdate {
        /// Outer iteration where it happened.
        iteration: usize,
    },
    /// Levenberg-Marquardt kept rejecting steps until it ran out of retries or damping.
    #[error(
        "No cost-reducing step found at iteration {iteration} after {retries} retries (damping {damping:e})"
    )]
    DampingExhausted {
        /// Outer iteration where it happened.
        iteration: usize,
        /// Rejected trial steps.
        retries: usize,
        /// Damping when it gave up.
        damping: f64,
    },
}

/// The API was called in an unsupported way.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum MisuseError {
    /// The problem or plan belongs to a different [`crate::State`].
    #[error("This {handle} was created by a different State")]
    ForeignState {
        /// Which handle kind.
        handle: &'static str,
    },
    /// Plans derived from this problem are still alive.
    #[error("Problem was deleted while {live} plans built from it are still alive")]
    ProblemHasLivePlans {
        /// How many plans are still alive.
        live: usize,
    },
    /// Step was called before Init.
    #[error("Step was called before Init")]
    StepBeforeInit,
    /// Something that reads the unknowns was requested before Init bound them.
    #[error("{operation} was requested before Init")]
    NotInitialized {
        /// What was requested.
        operation: &'static str,
    },
    /// Term index out of range.
    #[error("Problem has {terms} terms, there is no term {term}")]
    NoSuchTerm {
        /// Requested term.
        term: usize,
        /// How many terms exist.
        terms: usize,
    },
    /// The operation only makes sense for terms over grid dimensions.
    #[error("Term {term} is over a graph, not a grid")]
    NotAGridTerm {
        /// Requested term.
        term: usize,
    },
    /// The params were built for another problem.
    #[error("These params were built for a different problem")]
    ParamsForOtherProblem,
    /// No parameter with this name was declared.
    #[error("The problem declares no parameter named '{0}'")]
    UnknownParam(String),
    /// The parameter exists but is a different kind.
    #[error("Parameter '{name}' is declared as {declared}, not {given}")]
    WrongParamKind {
        /// Parameter name.
        name: String,
        /// How the problem declared it.
        declared: &'static str,
        /// How the caller tried to bind it.
        given: &'static str,
    },
    /// A declared parameter was never bound.
    #[error("Parameter '{0}' was never bound")]
    MissingParam(String),
}

/// Dense analysis of the linearized system failed.
#[derive(thiserror::Error, Debug)]
#[cfg_attr(not(feature = "unstable-exhaustive"), non_exhaustive)]
pub enum AnalysisError {
    /// Dense analysis materializes the whole Jacobian, so it's capped.
    #[error(
        "Dense analysis supports at most {max_unknowns} unknowns and {max_entries} Jacobian entries, but this plan has {rows} residuals and {unknowns} unknowns"
    )]
    TooLarge {
        /// Residuals in the plan.
        rows: usize,
        /// Unknowns in the plan.
        unknowns: usize,
        /// Cap on unknowns.
        max_unknowns: usize,
        /// Cap on dense entries.
        max_entries: usize,
    },
    /// Faer: could not decompose the normal matrix.
    #[error("Something went wrong doing SVD in faer")]
    FaerSvd(SvdError),
}
