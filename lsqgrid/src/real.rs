use num_traits::Float;

/// Element type of every plan buffer.
/// Implemented for `f32` (single precision) and `f64` (double precision).
pub(crate) trait Real: Float + Send + Sync + std::fmt::Debug + std::iter::Sum + 'static {
    /// Convert a literal or caller value into this precision.
    fn lit(x: f64) -> Self;
    /// Widen back to `f64` for reporting.
    fn widen(self) -> f64;
    /// Convert from a single precision caller buffer.
    fn from_single(x: f32) -> Self;
    /// Narrow for writing into a single precision caller buffer.
    fn narrow(self) -> f32;
}

impl Real for f32 {
    fn lit(x: f64) -> Self {
        x as f32
    }

    fn widen(self) -> f64 {
        f64::from(self)
    }

    fn from_single(x: f32) -> Self {
        x
    }

    fn narrow(self) -> f32 {
        self
    }
}

impl Real for f64 {
    fn lit(x: f64) -> Self {
        x
    }

    fn widen(self) -> f64 {
        self
    }

    fn from_single(x: f32) -> Self {
        f64::from(x)
    }

    fn narrow(self) -> f32 {
        self as f32
    }
}

/// Element width of a State's plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Precision {
    /// `f32` buffers and reductions.
    Single,
    /// `f64` buffers and reductions.
    Double,
}

impl Precision {
    /// Bytes per element.
    pub fn element_bytes(self) -> usize {
        match self {
            Precision::Single => std::mem::size_of::<f32>(),
            Precision::Double => std::mem::size_of::<f64>(),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Single => write!(f, "single"),
            Precision::Double => write!(f, "double"),
        }
    }
}
