//! Typed binding of caller-owned buffers to a problem's declared parameters.

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    Problem,
    error::{Error, MisuseError},
    problem::CompiledProblem,
    real::Real,
};

/// What kind of thing a parameter is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ParamKind {
    /// An array solved for. Bound mutably, solved values are written back.
    Unknown,
    /// A read-only array.
    Image,
    /// A single read-only value.
    Scalar,
    /// One `u32` index buffer per endpoint.
    Graph,
}

impl ParamKind {
    fn describe(self) -> &'static str {
        match self {
            ParamKind::Unknown => "an unknown",
            ParamKind::Image => "an image",
            ParamKind::Scalar => "a scalar",
            ParamKind::Graph => "a graph",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SchemaEntry {
    pub(crate) kind: ParamKind,
    /// Index into the problem's arrays, scalars or graphs, depending on `kind`.
    pub(crate) target: usize,
}

/// Every parameter a problem declares, keyed by name, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    entries: IndexMap<String, SchemaEntry>,
}

impl ParamSchema {
    /// Returns false if the name was already taken.
    pub(crate) fn insert(&mut self, name: &str, kind: ParamKind, target: usize) -> bool {
        if self.entries.contains_key(name) {
            return false;
        }
        self.entries
            .insert(name.to_owned(), SchemaEntry { kind, target });
        true
    }

    pub(crate) fn entry(&self, name: &str) -> Option<(usize, &SchemaEntry)> {
        self.entries.get_full(name).map(|(i, _, e)| (i, e))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &SchemaEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parameter names and kinds, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamKind)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.kind))
    }

    /// Kind of the named parameter.
    pub fn kind(&self, name: &str) -> Option<ParamKind> {
        self.entries.get(name).map(|e| e.kind)
    }

    /// How many parameters are declared.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A read-only caller buffer, in either precision.
#[derive(Debug, Clone, Copy)]
pub enum BufferRef<'a> {
    /// Single precision.
    F32(&'a [f32]),
    /// Double precision.
    F64(&'a [f64]),
}

impl BufferRef<'_> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            BufferRef::F32(b) => b.len(),
            BufferRef::F64(b) => b.len(),
        }
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn read_into<R: Real>(&self, out: &mut [R]) {
        match self {
            BufferRef::F32(b) => out.iter_mut().zip(b.iter()).for_each(|(o, &v)| *o = R::from_single(v)),
            BufferRef::F64(b) => out.iter_mut().zip(b.iter()).for_each(|(o, &v)| *o = R::lit(v)),
        }
    }
}

impl<'a> From<&'a [f32]> for BufferRef<'a> {
    fn from(value: &'a [f32]) -> Self {
        Self::F32(value)
    }
}

impl<'a> From<&'a [f64]> for BufferRef<'a> {
    fn from(value: &'a [f64]) -> Self {
        Self::F64(value)
    }
}

impl<'a> From<&'a Vec<f32>> for BufferRef<'a> {
    fn from(value: &'a Vec<f32>) -> Self {
        Self::F32(value)
    }
}

impl<'a> From<&'a Vec<f64>> for BufferRef<'a> {
    fn from(value: &'a Vec<f64>) -> Self {
        Self::F64(value)
    }
}

impl<'a, const N: usize> From<&'a [f64; N]> for BufferRef<'a> {
    fn from(value: &'a [f64; N]) -> Self {
        Self::F64(value)
    }
}

/// A caller buffer the solver reads and writes, in either precision.
#[derive(Debug)]
pub enum BufferMut<'a> {
    /// Single precision.
    F32(&'a mut [f32]),
    /// Double precision.
    F64(&'a mut [f64]),
}

impl BufferMut<'_> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            BufferMut::F32(b) => b.len(),
            BufferMut::F64(b) => b.len(),
        }
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element, widened to `f64`.
    pub fn get(&self, i: usize) -> Option<f64> {
        match self {
            BufferMut::F32(b) => b.get(i).map(|&v| f64::from(v)),
            BufferMut::F64(b) => b.get(i).copied(),
        }
    }

    /// Overwrite one element. Does nothing if `i` is out of range.
    pub fn set(&mut self, i: usize, value: f64) {
        match self {
            BufferMut::F32(b) => {
                if let Some(v) = b.get_mut(i) {
                    *v = value as f32;
                }
            }
            BufferMut::F64(b) => {
                if let Some(v) = b.get_mut(i) {
                    *v = value;
                }
            }
        }
    }

    pub(crate) fn read_into<R: Real>(&self, out: &mut [R]) {
        match self {
            BufferMut::F32(b) => out.iter_mut().zip(b.iter()).for_each(|(o, &v)| *o = R::from_single(v)),
            BufferMut::F64(b) => out.iter_mut().zip(b.iter()).for_each(|(o, &v)| *o = R::lit(v)),
        }
    }

    pub(crate) fn write_from<R: Real>(&mut self, values: &[R]) {
        match self {
            BufferMut::F32(b) => b.iter_mut().zip(values).for_each(|(o, v)| *o = v.narrow()),
            BufferMut::F64(b) => b.iter_mut().zip(values).for_each(|(o, v)| *o = v.widen()),
        }
    }
}

impl<'a> From<&'a mut [f32]> for BufferMut<'a> {
    fn from(value: &'a mut [f32]) -> Self {
        Self::F32(value)
    }
}

impl<'a> From<&'a mut [f64]> for BufferMut<'a> {
    fn from(value: &'a mut [f64]) -> Self {
        Self::F64(value)
    }
}

impl<'a> From<&'a mut Vec<f32>> for BufferMut<'a> {
    fn from(value: &'a mut Vec<f32>) -> Self {
        Self::F32(value)
    }
}

impl<'a> From<&'a mut Vec<f64>> for BufferMut<'a> {
    fn from(value: &'a mut Vec<f64>) -> Self {
        Self::F64(value)
    }
}

impl<'a, const N: usize> From<&'a mut [f64; N]> for BufferMut<'a> {
    fn from(value: &'a mut [f64; N]) -> Self {
        Self::F64(value)
    }
}

#[derive(Debug)]
pub(crate) enum Binding<'a> {
    Unknown(BufferMut<'a>),
    Image(BufferRef<'a>),
    Scalar(f64),
    Graph(Vec<&'a [u32]>),
}

/// Caller buffers for one problem, keyed by the names it declares.
///
/// ```
/// # use lsqgrid::{InitParams, ProblemParams, SolverKind, State};
/// let state = State::new(InitParams::default())?;
/// let problem = state.define_source(
///     "# problem\ndim N\nunknown c\nimage data[N]\n# energy\nover N: c - data\n",
///     SolverKind::GaussNewton,
/// )?;
/// let data = [1.0, 2.0, 3.0];
/// let mut c = [0.0];
/// let mut params = ProblemParams::new(&problem);
/// params.unknown("c", &mut c)?.image("data", &data)?;
/// # Ok::<(), lsqgrid::Error>(())
/// ```
#[derive(Debug)]
pub struct ProblemParams<'a> {
    pub(crate) problem: Arc<CompiledProblem>,
    pub(crate) bound: Vec<Option<Binding<'a>>>,
}

impl<'a> ProblemParams<'a> {
    /// Start binding parameters for this problem. Nothing is bound yet.
    pub fn new(problem: &Problem) -> Self {
        let n = problem.inner.schema.len();
        Self {
            problem: Arc::clone(&problem.inner),
            bound: (0..n).map(|_| None).collect(),
        }
    }

    fn slot(&self, name: &str, given: ParamKind) -> Result<usize, MisuseError> {
        let (i, entry) = self
            .problem
            .schema
            .entry(name)
            .ok_or_else(|| MisuseError::UnknownParam(name.to_owned()))?;
        if entry.kind != given {
            return Err(MisuseError::WrongParamKind {
                name: name.to_owned(),
                declared: entry.kind.describe(),
                given: given.describe(),
            });
        }
        Ok(i)
    }

    /// Bind an unknown array. Its current contents are the starting point,
    /// and each accepted step writes the new values back into it.
    pub fn unknown(
        &mut self,
        name: &str,
        buffer: impl Into<BufferMut<'a>>,
    ) -> Result<&mut Self, Error> {
        let i = self.slot(name, ParamKind::Unknown)?;
        self.bound[i] = Some(Binding::Unknown(buffer.into()));
        Ok(self)
    }

    /// Bind a read-only array.
    pub fn image(
        &mut self,
        name: &str,
        buffer: impl Into<BufferRef<'a>>,
    ) -> Result<&mut Self, Error> {
        let i = self.slot(name, ParamKind::Image)?;
        self.bound[i] = Some(Binding::Image(buffer.into()));
        Ok(self)
    }

    /// Bind a scalar.
    pub fn scalar(&mut self, name: &str, value: f64) -> Result<&mut Self, Error> {
        let i = self.slot(name, ParamKind::Scalar)?;
        self.bound[i] = Some(Binding::Scalar(value));
        Ok(self)
    }

    /// Bind a graph: one index buffer per declared endpoint, in declaration order.
    pub fn graph(&mut self, name: &str, endpoints: &[&'a [u32]]) -> Result<&mut Self, Error> {
        let i = self.slot(name, ParamKind::Graph)?;
        self.bound[i] = Some(Binding::Graph(endpoints.to_vec()));
        Ok(self)
    }

    /// The buffer bound to an unknown, to inspect or edit between steps.
    pub fn unknown_buffer_mut(&mut self, name: &str) -> Option<&mut BufferMut<'a>> {
        let (i, _) = self.problem.schema.entry(name)?;
        match self.bound.get_mut(i)? {
            Some(Binding::Unknown(buffer)) => Some(buffer),
            _ => None,
        }
    }

    /// Every declared parameter must be bound before the solver reads them.
    pub(crate) fn check_complete(&self) -> Result<(), MisuseError> {
        for ((name, _), bound) in self.problem.schema.entries().zip(&self.bound) {
            if bound.is_none() {
                return Err(MisuseError::MissingParam(name.to_owned()));
            }
        }
        Ok(())
    }
}
