use crate::problem::{ArrayRole, CompiledProblem, Domain};

/// Something suspicious about a problem which doesn't stop it compiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    /// Which energy term, if the warning is about one.
    pub about_term: Option<usize>,
    /// What's wrong.
    pub content: WarningContent,
}

/// The different kinds of [`Warning`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WarningContent {
    /// A declaration no term reads. It must still be bound.
    Unused {
        /// Declared name.
        name: String,
    },
    /// An unknown no term reads. The solver never changes it.
    UnknownNeverSolved {
        /// Declared name.
        name: String,
    },
    /// A term that reads no unknown only adds a constant to the cost.
    ConstantTerm,
}

pub(crate) fn lint(problem: &CompiledProblem) -> Vec<Warning> {
    let mut warnings = Vec::default();

    let mut array_used = vec![false; problem.arrays.len()];
    let mut scalar_used = vec![false; problem.scalars.len()];
    let mut graph_used = vec![false; problem.graphs.len()];
    let mut dim_used = vec![false; problem.dims.len()];
    for array in &problem.arrays {
        for &d in &array.dims {
            dim_used[d] = true;
        }
    }
    for graph in &problem.graphs {
        dim_used[graph.edge_dim] = true;
    }
    for (i, term) in problem.terms.iter().enumerate() {
        match &term.domain {
            Domain::Grid(dims) => dims.iter().for_each(|&d| dim_used[d] = true),
            Domain::Graph(g) => graph_used[*g] = true,
        }
        for load in &term.loads {
            array_used[load.array] = true;
        }
        for &s in &term.scalars_read {
            scalar_used[s] = true;
        }
        if term.partials.is_empty() {
            warnings.push(Warning {
                about_term: Some(i),
                content: WarningContent::ConstantTerm,
            });
        }
    }

    for (array, used) in problem.arrays.iter().zip(array_used) {
        if used {
            continue;
        }
        let name = array.name.clone();
        warnings.push(Warning {
            about_term: None,
            content: match array.role {
                ArrayRole::Unknown => WarningContent::UnknownNeverSolved { name },
                ArrayRole::Image => WarningContent::Unused { name },
            },
        });
    }
    let unused_scalars = problem
        .scalars
        .iter()
        .zip(scalar_used)
        .filter(|(_, used)| !used)
        .map(|(s, _)| s.clone());
    let unused_graphs = problem
        .graphs
        .iter()
        .zip(graph_used)
        .filter(|(_, used)| !used)
        .map(|(g, _)| g.name.clone());
    let unused_dims = problem
        .dims
        .iter()
        .zip(dim_used)
        .filter(|(_, used)| !used)
        .map(|(d, _)| d.clone());
    for name in unused_scalars.chain(unused_graphs).chain(unused_dims) {
        warnings.push(Warning {
            about_term: None,
            content: WarningContent::Unused { name },
        });
    }
    warnings
}

impl std::fmt::Display for WarningContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarningContent::Unused { name } => write!(
                f,
                "'{name}' is declared but never used. You still have to bind it, consider removing it."
            ),
            WarningContent::UnknownNeverSolved { name } => write!(
                f,
                "Unknown '{name}' isn't read by any energy term, so solving will never change it."
            ),
            WarningContent::ConstantTerm => write!(
                f,
                "This term doesn't read any unknown, so it only adds a constant to the cost."
            ),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.about_term {
            Some(term) => write!(f, "term {term}: {}", self.content),
            None => write!(f, "{}", self.content),
        }
    }
}
