//! Resolves a parsed problem's names and generates its kernels.

use indexmap::IndexMap;

use super::{
    Label, ProblemSource,
    declaration::{BinOp, Declaration, Node, Term},
};
use crate::{
    error::CompilationError,
    expr::Expr,
    params::{ParamKind, ParamSchema},
    problem::{
        Access, ArrayDecl, ArrayRole, CompiledProblem, Domain, EnergyTerm, GraphDecl, Load,
        Partial, SolverKind,
    },
    tape::Tape,
    warnings,
};

#[derive(Debug, Clone, Copy)]
enum Symbol {
    Dim(usize),
    Array(usize),
    Scalar(usize),
    Graph(usize),
}

/// Everything the declarations introduced.
#[derive(Default)]
struct Scope {
    symbols: IndexMap<String, Symbol>,
    dims: Vec<String>,
    arrays: Vec<ArrayDecl>,
    scalars: Vec<String>,
    graphs: Vec<GraphDecl>,
    schema: ParamSchema,
}

pub(crate) fn compile(
    source: &ProblemSource,
    kind: SolverKind,
) -> Result<CompiledProblem, CompilationError> {
    let mut scope = Scope::default();
    for (line, declaration) in &source.declarations {
        scope.declare(*line, declaration)?;
    }
    if !scope
        .arrays
        .iter()
        .any(|a| a.role == ArrayRole::Unknown)
    {
        return Err(CompilationError::NoUnknowns);
    }
    if source.terms.is_empty() {
        return Err(CompilationError::NoTerms);
    }
    let terms = source
        .terms
        .iter()
        .map(|term| scope.compile_term(term))
        .collect::<Result<Vec<_>, _>>()?;

    let mut problem = CompiledProblem {
        kind,
        dims: scope.dims,
        arrays: scope.arrays,
        scalars: scope.scalars,
        graphs: scope.graphs,
        terms,
        schema: scope.schema,
        warnings: Vec::new(),
        live_plans: Default::default(),
    };
    problem.warnings = warnings::lint(&problem);
    Ok(problem)
}

impl Scope {
    fn bind(&mut self, name: &Label, symbol: Symbol) -> Result<(), CompilationError> {
        if self.symbols.contains_key(name.as_str()) {
            return Err(CompilationError::DuplicateName {
                name: name.to_string(),
            });
        }
        self.symbols.insert(name.to_string(), symbol);
        Ok(())
    }

    fn dim(&self, line: usize, name: &Label) -> Result<usize, CompilationError> {
        match self.symbols.get(name.as_str()) {
            Some(Symbol::Dim(d)) => Ok(*d),
            _ => Err(CompilationError::Undefined {
                line,
                name: name.to_string(),
                expected: "dimension",
            }),
        }
    }

    fn declare(&mut self, line: usize, declaration: &Declaration) -> Result<(), CompilationError> {
        match declaration {
            Declaration::Dim(name) => {
                self.bind(name, Symbol::Dim(self.dims.len()))?;
                self.dims.push(name.to_string());
            }
            Declaration::Unknown { name, dims } | Declaration::Image { name, dims } => {
                let role = if matches!(declaration, Declaration::Unknown { .. }) {
                    ArrayRole::Unknown
                } else {
                    ArrayRole::Image
                };
                let dims = dims
                    .iter()
                    .map(|d| self.dim(line, d))
                    .collect::<Result<Vec<_>, _>>()?;
                let index = self.arrays.len();
                self.bind(name, Symbol::Array(index))?;
                let kind = match role {
                    ArrayRole::Unknown => ParamKind::Unknown,
                    ArrayRole::Image => ParamKind::Image,
                };
                self.schema.insert(name.as_str(), kind, index);
                self.arrays.push(ArrayDecl {
                    name: name.to_string(),
                    role,
                    dims,
                });
            }
            Declaration::Scalar(name) => {
                let index = self.scalars.len();
                self.bind(name, Symbol::Scalar(index))?;
                self.schema.insert(name.as_str(), ParamKind::Scalar, index);
                self.scalars.push(name.to_string());
            }
            Declaration::Graph {
                name,
                edge_dim,
                endpoints,
            } => {
                let edge_dim = self.dim(line, edge_dim)?;
                for (i, endpoint) in endpoints.iter().enumerate() {
                    if endpoints[..i].contains(endpoint) {
                        return Err(CompilationError::DuplicateName {
                            name: format!("{name}.{endpoint}"),
                        });
                    }
                }
                let index = self.graphs.len();
                self.bind(name, Symbol::Graph(index))?;
                self.schema.insert(name.as_str(), ParamKind::Graph, index);
                self.graphs.push(GraphDecl {
                    name: name.to_string(),
                    edge_dim,
                    endpoints: endpoints.iter().map(Label::to_string).collect(),
                });
            }
        }
        Ok(())
    }

    fn domain(&self, term: &Term) -> Result<Domain, CompilationError> {
        if let [single] = term.domain.as_slice() {
            if let Some(Symbol::Graph(g)) = self.symbols.get(single.as_str()) {
                return Ok(Domain::Graph(*g));
            }
        }
        let mut dims = Vec::with_capacity(term.domain.len());
        for name in &term.domain {
            let d = match self.symbols.get(name.as_str()) {
                Some(Symbol::Dim(d)) => *d,
                _ => {
                    return Err(CompilationError::Undefined {
                        line: term.line,
                        name: name.to_string(),
                        expected: "dimension or graph",
                    });
                }
            };
            if dims.contains(&d) {
                return Err(CompilationError::DomainMismatch {
                    line: term.line,
                    message: format!("dimension '{name}' appears twice in the domain"),
                });
            }
            dims.push(d);
        }
        Ok(Domain::Grid(dims))
    }

    fn compile_term(&self, term: &Term) -> Result<EnergyTerm, CompilationError> {
        let domain = self.domain(term)?;
        let mut resolver = Resolver {
            scope: self,
            line: term.line,
            domain: &domain,
            loads: Vec::new(),
            scalars: Vec::new(),
        };
        let residual = resolver.resolve(&term.residual)?;
        let Resolver { loads, scalars, .. } = resolver;

        // Simplification can drop reads entirely (`X * 0`), so compact the loads.
        let read: Vec<bool> = (0..loads.len()).map(|s| residual.reads_load(s)).collect();
        let (residual, loads) = if read.iter().all(|r| *r) {
            (residual, loads)
        } else {
            let mut next = 0;
            let map: Vec<Option<usize>> = read
                .iter()
                .map(|&r| {
                    r.then(|| {
                        next += 1;
                        next - 1
                    })
                })
                .collect();
            let loads = loads
                .into_iter()
                .zip(&read)
                .filter_map(|(load, &r)| r.then_some(load))
                .collect();
            (residual.remap_loads(&map), loads)
        };

        let partials = loads
            .iter()
            .enumerate()
            .filter(|(_, load)| self.arrays[load.array].role == ArrayRole::Unknown)
            .map(|(slot, _)| Partial {
                slot,
                tape: Tape::compile(&residual.derivative(slot)),
            })
            .collect();
        Ok(EnergyTerm {
            line: term.line,
            text: term.text.clone(),
            domain,
            loads,
            scalars_read: scalars,
            residual: Tape::compile(&residual),
            partials,
        })
    }
}

/// Turns one term's syntax tree into an [`Expr`], collecting the loads it makes.
struct Resolver<'a> {
    scope: &'a Scope,
    line: usize,
    domain: &'a Domain,
    loads: Vec<Load>,
    scalars: Vec<usize>,
}

impl Resolver<'_> {
    fn resolve(&mut self, node: &Node) -> Result<Expr, CompilationError> {
        Ok(match node {
            Node::Number(x) => Expr::Const(*x),
            Node::Name(name) => match self.scope.symbols.get(name.as_str()) {
                Some(Symbol::Scalar(s)) => {
                    if !self.scalars.contains(s) {
                        self.scalars.push(*s);
                    }
                    Expr::Scalar(*s)
                }
                Some(Symbol::Array(a)) => {
                    let access = self.same_cell(*a)?;
                    self.load(*a, access)
                }
                _ => return Err(self.undefined(name, "scalar or array")),
            },
            Node::Stencil { array, offsets } => {
                let a = self.array(array)?;
                let access = self.stencil(a, offsets)?;
                self.load(a, access)
            }
            Node::Endpoint { array, endpoint } => {
                let a = self.array(array)?;
                let access = self.endpoint(a, endpoint)?;
                self.load(a, access)
            }
            Node::Neg(a) => Expr::neg(self.resolve(a)?),
            Node::Binary { op, lhs, rhs } => {
                let lhs = self.resolve(lhs)?;
                let rhs = self.resolve(rhs)?;
                match op {
                    BinOp::Add => Expr::add(lhs, rhs),
                    BinOp::Sub => Expr::sub(lhs, rhs),
                    BinOp::Mul => Expr::mul(lhs, rhs),
                    BinOp::Div => Expr::div(lhs, rhs),
                }
            }
            Node::Pow(base, n) => Expr::powi(self.resolve(base)?, *n),
            Node::Call(func, arg) => Expr::call(*func, self.resolve(arg)?),
        })
    }

    /// The load slot for this read, shared with any identical read.
    fn load(&mut self, array: usize, access: Access) -> Expr {
        let load = Load { array, access };
        let slot = match self.loads.iter().position(|l| *l == load) {
            Some(slot) => slot,
            None => {
                self.loads.push(load);
                self.loads.len() - 1
            }
        };
        Expr::Load(slot)
    }

    fn undefined(&self, name: &Label, expected: &'static str) -> CompilationError {
        CompilationError::Undefined {
            line: self.line,
            name: name.to_string(),
            expected,
        }
    }

    fn mismatch(&self, message: String) -> CompilationError {
        CompilationError::DomainMismatch {
            line: self.line,
            message,
        }
    }

    fn array(&self, name: &Label) -> Result<usize, CompilationError> {
        match self.scope.symbols.get(name.as_str()) {
            Some(Symbol::Array(a)) => Ok(*a),
            _ => Err(self.undefined(name, "array")),
        }
    }

    fn dim_names(&self, dims: &[usize]) -> String {
        let names: Vec<&str> = dims.iter().map(|&d| self.scope.dims[d].as_str()).collect();
        format!("[{}]", names.join(", "))
    }

    /// A bare array name reads the work item's own cell.
    fn same_cell(&self, a: usize) -> Result<Access, CompilationError> {
        let array = &self.scope.arrays[a];
        if array.dims.is_empty() {
            return Ok(Access::Broadcast);
        }
        let domain_dims = match self.domain {
            Domain::Grid(dims) => dims.clone(),
            Domain::Graph(g) => vec![self.scope.graphs[*g].edge_dim],
        };
        if array.dims != domain_dims {
            return Err(self.mismatch(format!(
                "'{}' has dimensions {} but the term is over {}",
                array.name,
                self.dim_names(&array.dims),
                self.dim_names(&domain_dims),
            )));
        }
        Ok(Access::Stencil(vec![0; array.dims.len()]))
    }

    fn stencil(&self, a: usize, offsets: &[i32]) -> Result<Access, CompilationError> {
        let array = &self.scope.arrays[a];
        let dims = match self.domain {
            Domain::Grid(dims) => dims,
            Domain::Graph(_) => {
                return Err(CompilationError::Unsupported {
                    line: self.line,
                    message: format!("offset read '{}(..)' in a term over a graph", array.name),
                });
            }
        };
        if array.dims != *dims {
            return Err(self.mismatch(format!(
                "offset reads need '{}' to have the term's dimensions {}, but it has {}",
                array.name,
                self.dim_names(dims),
                self.dim_names(&array.dims),
            )));
        }
        if offsets.len() != dims.len() {
            return Err(self.mismatch(format!(
                "'{}' has {} dimensions but was read with {} offsets",
                array.name,
                dims.len(),
                offsets.len()
            )));
        }
        Ok(Access::Stencil(offsets.to_vec()))
    }

    fn endpoint(&self, a: usize, endpoint: &Label) -> Result<Access, CompilationError> {
        let array = &self.scope.arrays[a];
        let g = match self.domain {
            Domain::Graph(g) => *g,
            Domain::Grid(_) => {
                return Err(CompilationError::Unsupported {
                    line: self.line,
                    message: format!(
                        "endpoint read '{}[{endpoint}]' in a term that isn't over a graph",
                        array.name
                    ),
                });
            }
        };
        let graph = &self.scope.graphs[g];
        let e = graph
            .endpoints
            .iter()
            .position(|name| endpoint == &name.as_str())
            .ok_or_else(|| self.undefined(endpoint, "graph endpoint"))?;
        if array.dims.is_empty() {
            return Err(self.mismatch(format!(
                "'{}' has no dimensions, so it can't be indexed by an endpoint",
                array.name
            )));
        }
        Ok(Access::Endpoint(e))
    }
}
