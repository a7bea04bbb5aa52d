use crate::{
    error::{AllocationError, DimensionMismatchError, Error},
    params::{Binding, ProblemParams},
    problem::CompiledProblem,
    real::Real,
};

use super::PlanLayout;

/// For each element of an unknown array, the graph edges that read it, in edge order.
#[derive(Debug)]
pub(crate) struct Incidence {
    /// `offsets[c]..offsets[c + 1]` indexes `edges`.
    pub(crate) offsets: Vec<usize>,
    pub(crate) edges: Vec<u32>,
}

/// Everything a plan's kernels read and write.
#[derive(Debug)]
pub(crate) struct Workspace<R> {
    /// Current unknowns.
    pub(crate) x: Vec<R>,
    /// Unknowns being tried by a Levenberg-Marquardt step.
    pub(crate) x_trial: Vec<R>,
    pub(crate) images: Vec<R>,
    pub(crate) scalars: Vec<R>,
    /// Graph index buffers, by graph then endpoint.
    pub(crate) endpoints: Vec<Vec<Vec<u32>>>,
    pub(crate) incidence: Vec<Incidence>,
    /// Active work items, per term. Empty for terms where every item is active.
    pub(crate) masks: Vec<Vec<bool>>,
    pub(crate) residual: Vec<R>,
    /// Row-major, one row of `width` partials per residual.
    pub(crate) jacobian: Vec<R>,
    pub(crate) jp: Vec<R>,
    pub(crate) gradient: Vec<R>,
    /// Diagonal of `J^T J`.
    pub(crate) diagonal: Vec<R>,
    pub(crate) pcg: PcgBuffers<R>,
}

#[derive(Debug)]
pub(crate) struct PcgBuffers<R> {
    pub(crate) delta: Vec<R>,
    pub(crate) r: Vec<R>,
    pub(crate) z: Vec<R>,
    pub(crate) p: Vec<R>,
    pub(crate) ap: Vec<R>,
    pub(crate) preconditioner: Vec<R>,
}

/// A plan's workspace, at the State's precision.
#[derive(Debug)]
pub(crate) enum Buffers {
    Single(Workspace<f32>),
    Double(Workspace<f64>),
}

fn alloc<T: Clone>(len: usize, value: T) -> Result<Vec<T>, AllocationError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| AllocationError::HostAllocation { len })?;
    v.resize(len, value);
    Ok(v)
}

impl<R: Real> Workspace<R> {
    /// Allocate every buffer at its final size.
    pub(crate) fn allocate(
        layout: &PlanLayout,
        problem: &CompiledProblem,
    ) -> Result<Self, AllocationError> {
        let n = layout.n_unknowns;
        let zeros = |len| alloc(len, R::zero());

        let mut endpoints = Vec::with_capacity(problem.graphs.len());
        for (graph, &edges) in problem.graphs.iter().zip(&layout.graph_edges) {
            let buffers = graph
                .endpoints
                .iter()
                .map(|_| alloc(edges, 0u32))
                .collect::<Result<Vec<_>, _>>()?;
            endpoints.push(buffers);
        }
        let incidence = layout
            .incidences
            .iter()
            .map(|read| {
                Ok(Incidence {
                    offsets: alloc(layout.arrays[read.array].len + 1, 0usize)?,
                    edges: alloc(layout.graph_edges[read.graph], 0u32)?,
                })
            })
            .collect::<Result<Vec<_>, AllocationError>>()?;
        let masks = layout
            .terms
            .iter()
            .map(|term| {
                if !term.needs_mask() {
                    return Ok(Vec::new());
                }
                let mut mask = alloc(term.items, true)?;
                term.fill_mask(&mut mask);
                Ok(mask)
            })
            .collect::<Result<Vec<_>, AllocationError>>()?;

        Ok(Self {
            x: zeros(n)?,
            x_trial: zeros(n)?,
            images: zeros(layout.n_images)?,
            scalars: zeros(problem.scalars.len())?,
            endpoints,
            incidence,
            masks,
            residual: zeros(layout.n_residuals)?,
            jacobian: zeros(layout.n_jacobian)?,
            jp: zeros(layout.n_residuals)?,
            gradient: zeros(n)?,
            diagonal: zeros(n)?,
            pcg: PcgBuffers {
                delta: zeros(n)?,
                r: zeros(n)?,
                z: zeros(n)?,
                p: zeros(n)?,
                ap: zeros(n)?,
                preconditioner: zeros(n)?,
            },
        })
    }

    /// Upload every bound parameter, including the unknowns.
    /// Everything is validated before anything is copied.
    pub(crate) fn bind(
        &mut self,
        layout: &PlanLayout,
        problem: &CompiledProblem,
        params: &ProblemParams<'_>,
    ) -> Result<(), Error> {
        params.check_complete()?;
        validate(layout, problem, params)?;

        for ((_, entry), binding) in problem.schema.entries().zip(&params.bound) {
            match binding {
                Some(Binding::Unknown(buffer)) => {
                    let array = &layout.arrays[entry.target];
                    buffer.read_into(&mut self.x[array.offset..array.offset + array.len]);
                }
                Some(Binding::Image(buffer)) => {
                    let array = &layout.arrays[entry.target];
                    buffer.read_into(&mut self.images[array.offset..array.offset + array.len]);
                }
                Some(Binding::Scalar(value)) => self.scalars[entry.target] = R::lit(*value),
                Some(Binding::Graph(buffers)) => {
                    for (dst, src) in self.endpoints[entry.target].iter_mut().zip(buffers) {
                        dst.copy_from_slice(src);
                    }
                }
                None => {}
            }
        }
        self.rebuild_incidence(layout);
        Ok(())
    }

    /// Counting sort of edges by the element they read, so each bucket is in edge order.
    fn rebuild_incidence(&mut self, layout: &PlanLayout) {
        for (incidence, read) in self.incidence.iter_mut().zip(&layout.incidences) {
            let index = &self.endpoints[read.graph][read.endpoint];
            let offsets = &mut incidence.offsets;
            offsets.fill(0);
            for &i in index {
                offsets[i as usize + 1] += 1;
            }
            for c in 1..offsets.len() {
                offsets[c] += offsets[c - 1];
            }
            for (edge, &i) in index.iter().enumerate() {
                let cursor = &mut offsets[i as usize];
                incidence.edges[*cursor] = edge as u32;
                *cursor += 1;
            }
            // Each cursor now sits at the start of the next bucket.
            for c in (1..offsets.len()).rev() {
                offsets[c] = offsets[c - 1];
            }
            offsets[0] = 0;
        }
    }
}

/// Copy the current unknowns into the caller's buffers.
pub(crate) fn write_back<R: Real>(layout: &PlanLayout, x: &[R], params: &mut ProblemParams<'_>) {
    for ((_, entry), binding) in params.problem.schema.entries().zip(params.bound.iter_mut()) {
        if let Some(Binding::Unknown(buffer)) = binding {
            let array = &layout.arrays[entry.target];
            buffer.write_from(&x[array.offset..array.offset + array.len]);
        }
    }
}

fn validate(
    layout: &PlanLayout,
    problem: &CompiledProblem,
    params: &ProblemParams<'_>,
) -> Result<(), DimensionMismatchError> {
    let length = |name: &str, expected: usize, actual: usize| {
        if expected == actual {
            Ok(())
        } else {
            Err(DimensionMismatchError::BufferLength {
                name: name.to_owned(),
                expected,
                actual,
            })
        }
    };

    let mut graphs: Vec<Option<&[&[u32]]>> = vec![None; problem.graphs.len()];
    for ((name, entry), binding) in problem.schema.entries().zip(&params.bound) {
        match binding {
            Some(Binding::Unknown(buffer)) => {
                length(name, layout.arrays[entry.target].len, buffer.len())?
            }
            Some(Binding::Image(buffer)) => {
                length(name, layout.arrays[entry.target].len, buffer.len())?
            }
            Some(Binding::Graph(buffers)) => {
                let graph = &problem.graphs[entry.target];
                if buffers.len() != graph.endpoints.len() {
                    return Err(DimensionMismatchError::GraphEndpoints {
                        name: name.to_owned(),
                        expected: graph.endpoints.len(),
                        actual: buffers.len(),
                    });
                }
                for (endpoint, buffer) in graph.endpoints.iter().zip(buffers) {
                    length(
                        &format!("{name}[{endpoint}]"),
                        layout.graph_edges[entry.target],
                        buffer.len(),
                    )?;
                }
                graphs[entry.target] = Some(buffers.as_slice());
            }
            Some(Binding::Scalar(_)) | None => {}
        }
    }

    for read in &layout.endpoint_reads {
        let Some(buffers) = graphs[read.graph] else {
            continue;
        };
        let len = layout.arrays[read.array].len;
        let out_of_bounds = buffers[read.endpoint]
            .iter()
            .enumerate()
            .find(|&(_, &index)| index as usize >= len);
        if let Some((edge, &index)) = out_of_bounds {
            let graph = &problem.graphs[read.graph];
            return Err(DimensionMismatchError::GraphIndexOutOfBounds {
                graph: graph.name.clone(),
                edge,
                endpoint: graph.endpoints[read.endpoint].clone(),
                index,
                array: problem.arrays[read.array].name.clone(),
                len,
            });
        }
    }
    Ok(())
}
