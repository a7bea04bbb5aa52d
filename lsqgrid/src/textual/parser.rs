use super::{
    Label,
    declaration::{BinOp, Declaration, Node},
};
use crate::expr::Func;
use winnow::{
    Result as WResult,
    ascii::{digit0, digit1, space0, space1},
    combinator::{alt, delimited, opt, preceded, separated},
    prelude::*,
    token::{one_of, take_while},
};

/// `# energy`
pub(super) fn section_header(i: &mut &str) -> WResult<Label> {
    ('#', ws, Label::parse)
        .map(|(_, _, label)| label)
        .parse_next(i)
}

/// `over W, H: X(1, 0) - X`
pub(super) fn term(i: &mut &str) -> WResult<(Vec<Label>, Node)> {
    ("over", space1, name_list, ws, ':', ws, Node::parse)
        .map(|(_, _, domain, _, _, _, residual)| (domain, residual))
        .parse_next(i)
}

impl Declaration {
    pub fn parse(i: &mut &str) -> WResult<Self> {
        alt((
            preceded(("dim", space1), Label::parse).map(Declaration::Dim),
            (("unknown", space1), Label::parse, opt(dim_list)).map(|(_, name, dims)| {
                Declaration::Unknown {
                    name,
                    dims: dims.unwrap_or_default(),
                }
            }),
            (("image", space1), Label::parse, opt(dim_list)).map(|(_, name, dims)| {
                Declaration::Image {
                    name,
                    dims: dims.unwrap_or_default(),
                }
            }),
            preceded(("scalar", space1), Label::parse).map(Declaration::Scalar),
            Self::parse_graph,
        ))
        .parse_next(i)
    }

    fn parse_graph(i: &mut &str) -> WResult<Self> {
        let _ = ("graph", space1).parse_next(i)?;
        let name = Label::parse(i)?;
        ignore_ws(i);
        let edge_dim = delimited(('[', ws), Label::parse, (ws, ']')).parse_next(i)?;
        let _ = (ws, ':', ws).parse_next(i)?;
        let endpoints = name_list(i)?;
        Ok(Self::Graph {
            name,
            edge_dim,
            endpoints,
        })
    }
}

/// `[W, H]`, possibly empty.
fn dim_list(i: &mut &str) -> WResult<Vec<Label>> {
    delimited(
        (ws, '[', ws),
        separated(0.., Label::parse, (ws, ',', ws)),
        (ws, ']'),
    )
    .parse_next(i)
}

fn name_list(i: &mut &str) -> WResult<Vec<Label>> {
    separated(1.., Label::parse, (ws, ',', ws)).parse_next(i)
}

impl Node {
    /// Parse a residual expression.
    pub fn parse(i: &mut &str) -> WResult<Self> {
        sum(i)
    }
}

fn sum(i: &mut &str) -> WResult<Node> {
    let mut lhs = product(i)?;
    loop {
        let checkpoint = *i;
        ignore_ws(i);
        let Some(op) = opt(one_of(['+', '-'])).parse_next(i)? else {
            *i = checkpoint;
            return Ok(lhs);
        };
        ignore_ws(i);
        let rhs = product(i)?;
        let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
        lhs = Node::binary(op, lhs, rhs);
    }
}

fn product(i: &mut &str) -> WResult<Node> {
    let mut lhs = unary(i)?;
    loop {
        let checkpoint = *i;
        ignore_ws(i);
        let Some(op) = opt(one_of(['*', '/'])).parse_next(i)? else {
            *i = checkpoint;
            return Ok(lhs);
        };
        ignore_ws(i);
        let rhs = unary(i)?;
        let op = if op == '*' { BinOp::Mul } else { BinOp::Div };
        lhs = Node::binary(op, lhs, rhs);
    }
}

fn unary(i: &mut &str) -> WResult<Node> {
    alt((
        preceded(('-', ws), unary).map(|n| Node::Neg(Box::new(n))),
        power,
    ))
    .parse_next(i)
}

// Binds tighter than unary minus, so `-x^2` is `-(x^2)`.
fn power(i: &mut &str) -> WResult<Node> {
    let base = atom(i)?;
    let checkpoint = *i;
    ignore_ws(i);
    if opt('^').parse_next(i)?.is_none() {
        *i = checkpoint;
        return Ok(base);
    }
    ignore_ws(i);
    let exponent = signed_int(i)?;
    Ok(Node::Pow(Box::new(base), exponent))
}

fn atom(i: &mut &str) -> WResult<Node> {
    alt((
        delimited(('(', ws), sum, (ws, ')')),
        named,
        parse_number.map(Node::Number),
    ))
    .parse_next(i)
}

/// Function call, stencil read, endpoint read or bare name.
fn named(i: &mut &str) -> WResult<Node> {
    let name = Label::parse(i)?;
    if let Some(func) = Func::from_name(name.as_str()) {
        let arg = delimited((ws, '(', ws), sum, (ws, ')')).parse_next(i)?;
        return Ok(Node::Call(func, Box::new(arg)));
    }
    let offsets: Option<Vec<i32>> = opt(delimited(
        ('(', ws),
        separated(1.., signed_int, (ws, ',', ws)),
        (ws, ')'),
    ))
    .parse_next(i)?;
    if let Some(offsets) = offsets {
        return Ok(Node::Stencil {
            array: name,
            offsets,
        });
    }
    let endpoint = opt(delimited(('[', ws), Label::parse, (ws, ']'))).parse_next(i)?;
    Ok(match endpoint {
        Some(endpoint) => Node::Endpoint {
            array: name,
            endpoint,
        },
        None => Node::Name(name),
    })
}

fn signed_int(i: &mut &str) -> WResult<i32> {
    (opt('-'), digit1)
        .take()
        .verify_map(|s: &str| s.parse::<i32>().ok())
        .parse_next(i)
}

fn parse_number(i: &mut &str) -> WResult<f64> {
    (
        digit1,
        opt(('.', digit0)),
        opt((one_of(['e', 'E']), opt(one_of(['+', '-'])), digit1)),
    )
        .take()
        .verify_map(|s: &str| s.parse::<f64>().ok())
        .parse_next(i)
}

fn ws(i: &mut &str) -> WResult<()> {
    space0.parse_next(i).map(|_| ())
}

fn ignore_ws(i: &mut &str) {
    let _ = ws.parse_next(i);
}

impl Label {
    fn parse(i: &mut &str) -> WResult<Label> {
        (
            one_of(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
        )
            .take()
            .map(Label::from)
            .parse_next(i)
    }
}
