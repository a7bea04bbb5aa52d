//! Instantiating a compiled problem at concrete dimensions.
//!
//! A [`Plan`] fixes every size: how many work items each term has, where each array
//! lives in the unknown and image mirrors, which stencil reads can fall off the grid,
//! and the order kernels are launched in. All of its buffers are allocated up front
//! and never resized.

mod workspace;

use std::sync::{Arc, atomic::Ordering};

pub(crate) use workspace::{Buffers, Incidence, PcgBuffers, Workspace, write_back};

use crate::{
    device::{Device, KernelTimings, Lease},
    error::{AllocationError, DimensionMismatchError, Error},
    id::StateId,
    params::ParamKind,
    problem::{Access, ArrayRole, CompiledProblem, Domain},
    real::Precision,
    solver::{IterationStats, Progress, SolveStatus},
};

/// Where one declared array lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArrayLayout {
    /// Elements, the product of the array's dims.
    pub(crate) len: usize,
    /// Start within the unknown mirror (for unknowns) or the image mirror (for images).
    pub(crate) offset: usize,
    pub(crate) unknown: bool,
}

/// Which element of an array a load reads at a given work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadIndex {
    /// The work item's own linear index, shifted.
    Shifted(isize),
    Broadcast,
    /// Looked up through a graph endpoint buffer.
    Endpoint { graph: usize, endpoint: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadLayout {
    pub(crate) array: usize,
    pub(crate) unknown: bool,
    /// Copied from the array's [`ArrayLayout::offset`].
    pub(crate) offset: usize,
    pub(crate) index: LoadIndex,
}

impl LoadLayout {
    /// Element of the array read at `item`. Only meaningful for active items.
    #[inline]
    pub(crate) fn element(&self, item: usize, endpoints: &[Vec<Vec<u32>>]) -> usize {
        match self.index {
            LoadIndex::Shifted(shift) => item.wrapping_add_signed(shift),
            LoadIndex::Broadcast => 0,
            LoadIndex::Endpoint { graph, endpoint } => endpoints[graph][endpoint][item] as usize,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TermLayout {
    /// Work items, one residual each.
    pub(crate) items: usize,
    /// Grid extents of the domain, first fastest. A graph domain has one, its edge count.
    pub(crate) extents: Vec<usize>,
    pub(crate) loads: Vec<LoadLayout>,
    /// For each Jacobian column, the load it differentiates against.
    pub(crate) columns: Vec<usize>,
    /// Nonzero stencil offsets. If empty, every work item is active.
    stencils: Vec<Vec<i32>>,
    pub(crate) residual_offset: usize,
    pub(crate) jacobian_offset: usize,
    pub(crate) max_stack: usize,
}

impl TermLayout {
    /// Jacobian entries per residual.
    pub(crate) fn width(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn needs_mask(&self) -> bool {
        !self.stencils.is_empty()
    }

    /// A work item is active iff every stencil read stays inside the grid.
    pub(crate) fn fill_mask(&self, mask: &mut [bool]) {
        let mut coords = vec![0usize; self.extents.len()];
        for (item, active) in mask.iter_mut().enumerate() {
            let mut rest = item;
            for (c, &extent) in coords.iter_mut().zip(&self.extents) {
                *c = rest % extent;
                rest /= extent;
            }
            *active = self.stencils.iter().all(|offsets| {
                offsets
                    .iter()
                    .zip(coords.iter().zip(&self.extents))
                    .all(|(&o, (&c, &extent))| {
                        let moved = c as i64 + i64::from(o);
                        moved >= 0 && moved < extent as i64
                    })
            });
        }
    }
}

/// How a transpose gather finds the work items that touched an unknown element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Via {
    /// Element `c` was read by item `c - shift`.
    Shift(isize),
    /// Every item read element 0.
    Broadcast,
    /// Looked up in an incidence list rebuilt whenever the graph is bound.
    Incidence(usize),
}

/// One `J^T q` launch: the contribution of one Jacobian column of one term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Gather {
    pub(crate) term: usize,
    pub(crate) column: usize,
    /// The unknown array written to.
    pub(crate) array: usize,
    pub(crate) via: Via,
}

/// An array indexed through one endpoint of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EndpointRead {
    pub(crate) graph: usize,
    pub(crate) endpoint: usize,
    pub(crate) array: usize,
}

/// Kernel names, precomputed so launching never allocates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct Schedule {
    /// Per term.
    pub(crate) residual: Vec<String>,
    /// Per term.
    pub(crate) jacobian: Vec<String>,
    /// Per term.
    pub(crate) apply_j: Vec<String>,
    /// Per gather.
    pub(crate) apply_jt: Vec<String>,
    /// Per gather.
    pub(crate) diagonal: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlanLayout {
    pub(crate) dims: Vec<usize>,
    pub(crate) arrays: Vec<ArrayLayout>,
    pub(crate) graph_edges: Vec<usize>,
    pub(crate) terms: Vec<TermLayout>,
    pub(crate) gathers: Vec<Gather>,
    /// Graph-indexed reads of unknowns, each with its own incidence list.
    pub(crate) incidences: Vec<EndpointRead>,
    /// Every graph-indexed read, checked for bounds when graphs are bound.
    pub(crate) endpoint_reads: Vec<EndpointRead>,
    pub(crate) n_unknowns: usize,
    pub(crate) n_images: usize,
    pub(crate) n_residuals: usize,
    pub(crate) n_jacobian: usize,
    pub(crate) schedule: Schedule,
}

fn product(sizes: impl IntoIterator<Item = usize>) -> Result<usize, AllocationError> {
    sizes
        .into_iter()
        .try_fold(1usize, |acc, s| acc.checked_mul(s))
        .ok_or(AllocationError::SizeOverflow)
}

fn add(a: usize, b: usize) -> Result<usize, AllocationError> {
    a.checked_add(b).ok_or(AllocationError::SizeOverflow)
}

impl PlanLayout {
    pub(crate) fn new(problem: &CompiledProblem, dims: &[u32]) -> Result<Self, Error> {
        if dims.len() != problem.dims.len() {
            return Err(DimensionMismatchError::Arity {
                expected: problem.dims.len(),
                actual: dims.len(),
            }
            .into());
        }
        let dims: Vec<usize> = dims.iter().map(|&d| d as usize).collect();

        let mut n_unknowns = 0;
        let mut n_images = 0;
        let mut arrays = Vec::with_capacity(problem.arrays.len());
        for array in &problem.arrays {
            let len = product(array.dims.iter().map(|&d| dims[d]))?;
            let unknown = array.role == ArrayRole::Unknown;
            let next = if unknown {
                &mut n_unknowns
            } else {
                &mut n_images
            };
            arrays.push(ArrayLayout {
                len,
                offset: *next,
                unknown,
            });
            *next = add(*next, len)?;
        }
        let graph_edges: Vec<usize> = problem.graphs.iter().map(|g| dims[g.edge_dim]).collect();

        let mut terms = Vec::with_capacity(problem.terms.len());
        let mut gathers = Vec::new();
        let mut incidences: Vec<EndpointRead> = Vec::new();
        let mut endpoint_reads: Vec<EndpointRead> = Vec::new();
        let mut n_residuals = 0;
        let mut n_jacobian = 0;
        for (t, term) in problem.terms.iter().enumerate() {
            let (extents, graph) = match &term.domain {
                Domain::Grid(ds) => (ds.iter().map(|&d| dims[d]).collect::<Vec<_>>(), None),
                Domain::Graph(g) => (vec![graph_edges[*g]], Some(*g)),
            };
            let items = product(extents.iter().copied())?;

            let mut stencils = Vec::new();
            let mut loads = Vec::with_capacity(term.loads.len());
            for load in &term.loads {
                let array = &arrays[load.array];
                let index = match &load.access {
                    Access::Stencil(offsets) => {
                        let mut shift: isize = 0;
                        let mut stride: isize = 1;
                        for (&o, &extent) in offsets.iter().zip(&extents) {
                            shift = (o as isize)
                                .checked_mul(stride)
                                .and_then(|s| s.checked_add(shift))
                                .ok_or(AllocationError::SizeOverflow)?;
                            stride = stride
                                .checked_mul(extent as isize)
                                .ok_or(AllocationError::SizeOverflow)?;
                        }
                        if offsets.iter().any(|&o| o != 0) && !stencils.contains(offsets) {
                            stencils.push(offsets.clone());
                        }
                        LoadIndex::Shifted(shift)
                    }
                    Access::Broadcast => LoadIndex::Broadcast,
                    Access::Endpoint(endpoint) => {
                        // The compiler only allows endpoint reads in graph terms.
                        let graph = graph.unwrap_or_default();
                        let read = EndpointRead {
                            graph,
                            endpoint: *endpoint,
                            array: load.array,
                        };
                        if !endpoint_reads.contains(&read) {
                            endpoint_reads.push(read);
                        }
                        LoadIndex::Endpoint {
                            graph,
                            endpoint: *endpoint,
                        }
                    }
                };
                loads.push(LoadLayout {
                    array: load.array,
                    unknown: array.unknown,
                    offset: array.offset,
                    index,
                });
            }

            let columns: Vec<usize> = term.partials.iter().map(|p| p.slot).collect();
            for (column, &slot) in columns.iter().enumerate() {
                let load = &loads[slot];
                let via = match load.index {
                    LoadIndex::Shifted(shift) => Via::Shift(shift),
                    LoadIndex::Broadcast => Via::Broadcast,
                    LoadIndex::Endpoint { graph, endpoint } => {
                        let read = EndpointRead {
                            graph,
                            endpoint,
                            array: load.array,
                        };
                        let i = match incidences.iter().position(|r| *r == read) {
                            Some(i) => i,
                            None => {
                                incidences.push(read);
                                incidences.len() - 1
                            }
                        };
                        Via::Incidence(i)
                    }
                };
                gathers.push(Gather {
                    term: t,
                    column,
                    array: load.array,
                    via,
                });
            }

            let width = columns.len();
            terms.push(TermLayout {
                items,
                extents,
                loads,
                columns,
                stencils,
                residual_offset: n_residuals,
                jacobian_offset: n_jacobian,
                max_stack: term.max_stack(),
            });
            n_residuals = add(n_residuals, items)?;
            n_jacobian = add(n_jacobian, product([items, width])?)?;
        }

        let schedule = Schedule {
            residual: (0..terms.len()).map(|t| format!("residual[{t}]")).collect(),
            jacobian: (0..terms.len()).map(|t| format!("jacobian[{t}]")).collect(),
            apply_j: (0..terms.len()).map(|t| format!("jp[{t}]")).collect(),
            apply_jt: gathers
                .iter()
                .map(|g| format!("jtq[{}.{}]", g.term, g.column))
                .collect(),
            diagonal: gathers
                .iter()
                .map(|g| format!("jtj_diag[{}.{}]", g.term, g.column))
                .collect(),
        };

        Ok(Self {
            dims,
            arrays,
            graph_edges,
            terms,
            gathers,
            incidences,
            endpoint_reads,
            n_unknowns,
            n_images,
            n_residuals,
            n_jacobian,
            schedule,
        })
    }

    /// What the workspace for this layout will hold.
    pub(crate) fn footprint(&self, n_scalars: usize, endpoints: &[usize]) -> Result<Footprint, AllocationError> {
        let n = self.n_unknowns;
        // x, x_trial, gradient, diagonal, then the PCG vectors: delta, r, z, p, Ap, preconditioner.
        let mut reals = product([10, n])?;
        for extra in [self.n_images, n_scalars, self.n_residuals, self.n_residuals, self.n_jacobian] {
            reals = add(reals, extra)?;
        }
        let mut buffers = 15;

        let mut indices = 0;
        for (&edges, &count) in self.graph_edges.iter().zip(endpoints) {
            indices = add(indices, product([edges, count])?)?;
            buffers += count;
        }
        let mut offsets = 0;
        for read in &self.incidences {
            indices = add(indices, self.graph_edges[read.graph])?;
            offsets = add(offsets, add(self.arrays[read.array].len, 1)?)?;
            buffers += 2;
        }
        let mut flags = 0;
        for term in self.terms.iter().filter(|t| t.needs_mask()) {
            flags = add(flags, term.items)?;
            buffers += 1;
        }
        Ok(Footprint {
            reals,
            indices,
            offsets,
            flags,
            buffers,
        })
    }

    /// Every kernel one outer iteration launches, in order.
    /// `J p` and `J^T q` repeat once per inner iteration.
    pub(crate) fn launch_order(&self) -> impl Iterator<Item = &str> {
        let s = &self.schedule;
        s.residual
            .iter()
            .chain(&s.jacobian)
            .chain(&s.apply_jt)
            .chain(&s.diagonal)
            .chain(&s.apply_j)
            .chain(&s.apply_jt)
            .map(String::as_str)
    }
}

/// Element counts of every buffer a plan allocates, by element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Footprint {
    pub(crate) reals: usize,
    pub(crate) indices: usize,
    pub(crate) offsets: usize,
    pub(crate) flags: usize,
    pub(crate) buffers: usize,
}

impl Footprint {
    pub(crate) fn bytes(&self, precision: Precision) -> Result<usize, AllocationError> {
        let parts = [
            product([self.reals, precision.element_bytes()])?,
            product([self.indices, std::mem::size_of::<u32>()])?,
            product([self.offsets, std::mem::size_of::<usize>()])?,
            product([self.flags, std::mem::size_of::<bool>()])?,
        ];
        parts.into_iter().try_fold(0, add)
    }
}

/// A problem instantiated at fixed dimensions, with all of its workspace allocated.
///
/// Created by [`crate::State::plan`] and advanced by [`crate::State::init`] and
/// [`crate::State::step`]. Dropping it (or passing it to [`crate::State::free_plan`])
/// gives its memory back to the device.
pub struct Plan {
    pub(crate) problem: Arc<CompiledProblem>,
    pub(crate) state_id: StateId,
    pub(crate) precision: Precision,
    pub(crate) layout: PlanLayout,
    pub(crate) buffers: Buffers,
    pub(crate) progress: Progress,
    lease: Lease,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("dims", &self.layout.dims)
            .field("precision", &self.precision)
            .field("workspace_bytes", &self.lease.bytes())
            .field("status", &self.progress.status)
            .finish_non_exhaustive()
    }
}

impl Plan {
    /// Reserve and allocate everything. On failure nothing stays reserved.
    pub(crate) fn new(
        device: &Device,
        problem: &Arc<CompiledProblem>,
        state_id: StateId,
        precision: Precision,
        dims: &[u32],
        collect_kernel_timing: bool,
    ) -> Result<Self, Error> {
        let layout = PlanLayout::new(problem, dims)?;
        let endpoints: Vec<usize> = problem.graphs.iter().map(|g| g.endpoints.len()).collect();
        let footprint = layout.footprint(problem.scalars.len(), &endpoints)?;
        let lease = device.reserve(footprint.bytes(precision)?, footprint.buffers)?;
        let buffers = match precision {
            Precision::Single => Buffers::Single(Workspace::allocate(&layout, problem)?),
            Precision::Double => Buffers::Double(Workspace::allocate(&layout, problem)?),
        };
        problem.live_plans.fetch_add(1, Ordering::AcqRel);
        Ok(Self {
            problem: Arc::clone(problem),
            state_id,
            precision,
            layout,
            buffers,
            progress: Progress::new(collect_kernel_timing),
            lease,
        })
    }

    /// Size of each declared dimension.
    pub fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    /// Bytes of workspace this plan holds on its device.
    pub fn workspace_bytes(&self) -> usize {
        self.lease.bytes()
    }

    /// How many elements a parameter is bound with at these dims: the array length,
    /// the edge count of a graph (per endpoint), or 1 for a scalar.
    pub fn param_len(&self, name: &str) -> Option<usize> {
        let (_, entry) = self.problem.schema.entry(name)?;
        match entry.kind {
            ParamKind::Unknown | ParamKind::Image => {
                self.layout.arrays.get(entry.target).map(|a| a.len)
            }
            ParamKind::Scalar => Some(1),
            ParamKind::Graph => self.layout.graph_edges.get(entry.target).copied(),
        }
    }

    /// Element width of every buffer.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Total elements across every unknown array.
    pub fn num_unknowns(&self) -> usize {
        self.layout.n_unknowns
    }

    /// Total residuals across every term, including inactive work items.
    pub fn num_residuals(&self) -> usize {
        self.layout.n_residuals
    }

    /// Names of the kernels one outer iteration launches, in launch order.
    pub fn kernel_schedule(&self) -> impl Iterator<Item = &str> {
        self.layout.launch_order()
    }

    /// Where the solve is up to.
    pub fn status(&self) -> &SolveStatus {
        &self.progress.status
    }

    /// Outer iterations completed since the last Init.
    pub fn iteration(&self) -> usize {
        self.progress.iteration
    }

    /// Current Levenberg-Marquardt damping.
    pub fn damping(&self) -> f64 {
        self.progress.damping
    }

    /// One entry per completed Step since the last Init.
    pub fn history(&self) -> &[IterationStats] {
        &self.progress.history
    }

    /// Per-kernel wall time, if the State collects it.
    pub fn kernel_timings(&self) -> Option<&KernelTimings> {
        self.progress.timings.as_ref()
    }
}

impl Drop for Plan {
    fn drop(&mut self) {
        self.problem.live_plans.fetch_sub(1, Ordering::AcqRel);
    }
}
