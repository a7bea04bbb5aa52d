//! Symbolic residual expressions and their derivatives.
//!
//! An energy term's residual is an [`Expr`] over its array loads and scalars.
//! Partial derivatives are taken symbolically, one per unknown load,
//! then lowered to a [`crate::tape::Tape`] for evaluation.

/// Elementary functions usable in residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum Func {
    /// Square root.
    Sqrt,
    /// Natural exponential.
    Exp,
    /// Natural logarithm.
    Log,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
}

impl Func {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(Self::Sqrt),
            "exp" => Some(Self::Exp),
            "log" => Some(Self::Log),
            "sin" => Some(Self::Sin),
            "cos" => Some(Self::Cos),
            _ => None,
        }
    }

    pub(crate) fn eval(self, x: f64) -> f64 {
        match self {
            Func::Sqrt => libm::sqrt(x),
            Func::Exp => libm::exp(x),
            Func::Log => libm::log(x),
            Func::Sin => libm::sin(x),
            Func::Cos => libm::cos(x),
        }
    }
}

impl std::fmt::Display for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Func::Sqrt => "sqrt",
            Func::Exp => "exp",
            Func::Log => "log",
            Func::Sin => "sin",
            Func::Cos => "cos",
        };
        write!(f, "{name}")
    }
}

/// A residual expression. Loads and scalars are referred to by slot.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Const(f64),
    /// Scalar parameter slot.
    Scalar(usize),
    /// Array load slot within the term.
    Load(usize),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Powi(Box<Expr>, i32),
    Call(Func, Box<Expr>),
}

// Constructors fold constants and drop identities, so derivatives stay small.
impl Expr {
    pub(crate) fn neg(a: Expr) -> Expr {
        match a {
            Expr::Const(c) => Expr::Const(-c),
            Expr::Neg(inner) => *inner,
            a => Expr::Neg(Box::new(a)),
        }
    }

    pub(crate) fn add(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x + y),
            (Expr::Const(z), e) | (e, Expr::Const(z)) if z == 0.0 => e,
            (a, Expr::Neg(b)) => Expr::Sub(Box::new(a), b),
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }

    pub(crate) fn sub(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x - y),
            (e, Expr::Const(z)) if z == 0.0 => e,
            (Expr::Const(z), e) if z == 0.0 => Expr::neg(e),
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }

    pub(crate) fn mul(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x * y),
            (Expr::Const(z), _) | (_, Expr::Const(z)) if z == 0.0 => Expr::Const(0.0),
            (Expr::Const(o), e) | (e, Expr::Const(o)) if o == 1.0 => e,
            (Expr::Const(m), e) | (e, Expr::Const(m)) if m == -1.0 => Expr::neg(e),
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    pub(crate) fn div(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (Expr::Const(x), Expr::Const(y)) if y != 0.0 => Expr::Const(x / y),
            (Expr::Const(z), _) if z == 0.0 => Expr::Const(0.0),
            (e, Expr::Const(o)) if o == 1.0 => e,
            (a, b) => Expr::Div(Box::new(a), Box::new(b)),
        }
    }

    pub(crate) fn powi(a: Expr, n: i32) -> Expr {
        match (a, n) {
            (_, 0) => Expr::Const(1.0),
            (a, 1) => a,
            (Expr::Const(x), n) => Expr::Const(x.powi(n)),
            (a, n) => Expr::Powi(Box::new(a), n),
        }
    }

    pub(crate) fn call(func: Func, a: Expr) -> Expr {
        match a {
            Expr::Const(x) => Expr::Const(func.eval(x)),
            a => Expr::Call(func, Box::new(a)),
        }
    }

    /// Partial derivative with respect to one load slot.
    pub(crate) fn derivative(&self, slot: usize) -> Expr {
        match self {
            Expr::Const(_) | Expr::Scalar(_) => Expr::Const(0.0),
            Expr::Load(s) => Expr::Const(if *s == slot { 1.0 } else { 0.0 }),
            Expr::Neg(a) => Expr::neg(a.derivative(slot)),
            Expr::Add(a, b) => Expr::add(a.derivative(slot), b.derivative(slot)),
            Expr::Sub(a, b) => Expr::sub(a.derivative(slot), b.derivative(slot)),
            Expr::Mul(a, b) => Expr::add(
                Expr::mul(a.derivative(slot), (**b).clone()),
                Expr::mul((**a).clone(), b.derivative(slot)),
            ),
            Expr::Div(a, b) => {
                // (a/b)' = a'/b - a b' / b^2
                let da = a.derivative(slot);
                let db = b.derivative(slot);
                Expr::sub(
                    Expr::div(da, (**b).clone()),
                    Expr::div(
                        Expr::mul((**a).clone(), db),
                        Expr::powi((**b).clone(), 2),
                    ),
                )
            }
            Expr::Powi(a, n) => Expr::mul(
                Expr::mul(Expr::Const(f64::from(*n)), Expr::powi((**a).clone(), n - 1)),
                a.derivative(slot),
            ),
            Expr::Call(func, a) => {
                let da = a.derivative(slot);
                let outer = match func {
                    Func::Sqrt => Expr::div(
                        Expr::Const(0.5),
                        Expr::call(Func::Sqrt, (**a).clone()),
                    ),
                    Func::Exp => Expr::call(Func::Exp, (**a).clone()),
                    Func::Log => Expr::div(Expr::Const(1.0), (**a).clone()),
                    Func::Sin => Expr::call(Func::Cos, (**a).clone()),
                    Func::Cos => Expr::neg(Expr::call(Func::Sin, (**a).clone())),
                };
                Expr::mul(outer, da)
            }
        }
    }

    /// Does this expression read the given load slot?
    pub(crate) fn reads_load(&self, slot: usize) -> bool {
        match self {
            Expr::Const(_) | Expr::Scalar(_) => false,
            Expr::Load(s) => *s == slot,
            Expr::Neg(a) | Expr::Powi(a, _) | Expr::Call(_, a) => a.reads_load(slot),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) => {
                a.reads_load(slot) || b.reads_load(slot)
            }
        }
    }

    /// Renumber load slots. Every slot this expression reads must map to `Some`.
    pub(crate) fn remap_loads(&self, map: &[Option<usize>]) -> Expr {
        let re = |e: &Expr| Box::new(e.remap_loads(map));
        match self {
            Expr::Const(_) | Expr::Scalar(_) => self.clone(),
            Expr::Load(s) => Expr::Load(map[*s].unwrap_or(*s)),
            Expr::Neg(a) => Expr::Neg(re(a)),
            Expr::Add(a, b) => Expr::Add(re(a), re(b)),
            Expr::Sub(a, b) => Expr::Sub(re(a), re(b)),
            Expr::Mul(a, b) => Expr::Mul(re(a), re(b)),
            Expr::Div(a, b) => Expr::Div(re(a), re(b)),
            Expr::Powi(a, n) => Expr::Powi(re(a), *n),
            Expr::Call(func, a) => Expr::Call(*func, re(a)),
        }
    }

    /// Reference evaluation, used to check compiled tapes.
    #[cfg(test)]
    pub(crate) fn eval(&self, loads: &[f64], scalars: &[f64]) -> f64 {
        match self {
            Expr::Const(c) => *c,
            Expr::Scalar(s) => scalars[*s],
            Expr::Load(s) => loads[*s],
            Expr::Neg(a) => -a.eval(loads, scalars),
            Expr::Add(a, b) => a.eval(loads, scalars) + b.eval(loads, scalars),
            Expr::Sub(a, b) => a.eval(loads, scalars) - b.eval(loads, scalars),
            Expr::Mul(a, b) => a.eval(loads, scalars) * b.eval(loads, scalars),
            Expr::Div(a, b) => a.eval(loads, scalars) / b.eval(loads, scalars),
            Expr::Powi(a, n) => a.eval(loads, scalars).powi(*n),
            Expr::Call(func, a) => func.eval(a.eval(loads, scalars)),
        }
    }
}
