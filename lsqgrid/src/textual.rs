//! Problem text: parsing and compiling into a runnable form.
//!
//! A problem file has a `# problem` section declaring dimensions, arrays,
//! scalars and graphs, then an `# energy` section with one residual term per line:
//!
//! ```text
//! # problem
//! dim N
//! unknown offset
//! image data[N]
//! # energy
//! over N: offset - data
//! ```

mod compiler;
mod declaration;
mod parser;

use std::str::FromStr;

pub use declaration::{BinOp, Declaration, Node, Term};
pub use crate::expr::Func;
use winnow::Parser;

use crate::error::CompilationError;
pub(crate) use compiler::compile;

/// A parsed, not yet compiled, problem file.
#[derive(Debug, PartialEq)]
pub struct ProblemSource {
    /// Declarations with their 1-based line numbers, in file order.
    pub declarations: Vec<(usize, Declaration)>,
    /// Energy terms in file order.
    pub terms: Vec<Term>,
}

impl FromStr for ProblemSource {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut lines = s
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, strip_comment(line).trim()))
            .filter(|(_, line)| !line.is_empty());

        let mut last_line = 0;
        match lines.next() {
            Some((n, line)) if section(line).as_deref() == Some("problem") => last_line = n,
            other => {
                return Err(CompilationError::MissingSection {
                    expected: "problem",
                    line: other.map(|(n, _)| n).unwrap_or(1),
                });
            }
        }

        let mut declarations = Vec::new();
        let mut in_energy = false;
        let mut terms = Vec::new();
        for (n, line) in lines {
            last_line = n;
            if let Some(name) = section(line) {
                if name == "energy" && !in_energy {
                    in_energy = true;
                    continue;
                }
                return Err(CompilationError::Syntax {
                    line: n,
                    message: format!("unexpected section '# {name}'"),
                });
            }
            if in_energy {
                let (domain, residual) = parser::term
                    .parse(line)
                    .map_err(|e| syntax_error(n, e))?;
                terms.push(Term {
                    line: n,
                    domain,
                    residual,
                    text: line.to_owned(),
                });
            } else {
                let declaration = Declaration::parse
                    .parse(line)
                    .map_err(|e| syntax_error(n, e))?;
                declarations.push((n, declaration));
            }
        }
        if !in_energy {
            return Err(CompilationError::MissingSection {
                expected: "energy",
                line: last_line + 1,
            });
        }
        Ok(Self {
            declarations,
            terms,
        })
    }
}

fn syntax_error(line: usize, e: impl std::fmt::Display) -> CompilationError {
    CompilationError::Syntax {
        line,
        message: e.to_string(),
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

/// If this line is a section header like `# energy`, its name.
fn section(line: &str) -> Option<String> {
    parser::section_header.parse(line).ok().map(|l| l.0)
}

/// A name in a problem file.
#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct Label(pub(crate) String);

impl Label {
    /// The name as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Label {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl PartialEq<&str> for Label {
    fn eq(&self, other: &&str) -> bool {
        &self.0 == other
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
