//! Stack bytecode for residual and derivative kernels.

use crate::{
    expr::{Expr, Func},
    real::Real,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Op {
    Const(f64),
    Scalar(u32),
    Load(u32),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Powi(i32),
    Call(Func),
}

/// A compiled expression, evaluated once per work item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tape {
    ops: Vec<Op>,
    max_stack: usize,
}

impl Tape {
    pub(crate) fn compile(expr: &Expr) -> Self {
        let mut ops = Vec::new();
        emit(expr, &mut ops);
        let mut depth = 0usize;
        let mut max_stack = 0usize;
        for op in &ops {
            match op {
                Op::Const(_) | Op::Scalar(_) | Op::Load(_) => depth += 1,
                Op::Neg | Op::Powi(_) | Op::Call(_) => {}
                Op::Add | Op::Sub | Op::Mul | Op::Div => depth -= 1,
            }
            max_stack = max_stack.max(depth);
        }
        Self { ops, max_stack }
    }

    pub(crate) fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// True if the tape is a single constant.
    pub(crate) fn as_const(&self) -> Option<f64> {
        match self.ops.as_slice() {
            [Op::Const(c)] => Some(*c),
            _ => None,
        }
    }

    /// Evaluate with the given loads and scalars.
    /// `stack` is scratch; it is cleared first and reused across calls.
    #[inline]
    pub(crate) fn eval<R: Real>(&self, loads: &[R], scalars: &[R], stack: &mut Vec<R>) -> R {
        stack.clear();
        for op in &self.ops {
            match *op {
                Op::Const(c) => stack.push(R::lit(c)),
                Op::Scalar(s) => stack.push(scalars[s as usize]),
                Op::Load(s) => stack.push(loads[s as usize]),
                Op::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                Op::Powi(n) => {
                    let a = pop(stack);
                    stack.push(a.powi(n));
                }
                Op::Call(func) => {
                    let a = pop(stack);
                    stack.push(match func {
                        Func::Sqrt => a.sqrt(),
                        Func::Exp => a.exp(),
                        Func::Log => a.ln(),
                        Func::Sin => a.sin(),
                        Func::Cos => a.cos(),
                    });
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match op {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        _ => a / b,
                    });
                }
            }
        }
        pop(stack)
    }
}

// Compiled tapes are balanced, so the stack is never empty here.
// An empty pop would mean a compiler bug; NaN makes the solve fail loudly.
#[inline]
fn pop<R: Real>(stack: &mut Vec<R>) -> R {
    stack.pop().unwrap_or_else(R::nan)
}

fn emit(expr: &Expr, ops: &mut Vec<Op>) {
    match expr {
        Expr::Const(c) => ops.push(Op::Const(*c)),
        Expr::Scalar(s) => ops.push(Op::Scalar(*s as u32)),
        Expr::Load(s) => ops.push(Op::Load(*s as u32)),
        Expr::Neg(a) => {
            emit(a, ops);
            ops.push(Op::Neg);
        }
        Expr::Powi(a, n) => {
            emit(a, ops);
            ops.push(Op::Powi(*n));
        }
        Expr::Call(func, a) => {
            emit(a, ops);
            ops.push(Op::Call(*func));
        }
        Expr::Add(a, b) => binary(a, b, Op::Add, ops),
        Expr::Sub(a, b) => binary(a, b, Op::Sub, ops),
        Expr::Mul(a, b) => binary(a, b, Op::Mul, ops),
        Expr::Div(a, b) => binary(a, b, Op::Div, ops),
    }
}

fn binary(a: &Expr, b: &Expr, op: Op, ops: &mut Vec<Op>) {
    emit(a, ops);
    emit(b, ops);
    ops.push(op);
}
