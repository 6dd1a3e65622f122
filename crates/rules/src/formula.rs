//! Formula grammar for calculation rules and formula aggregates.
//!
//! ```text
//! formula  := operand (op operand)*
//! op       := '*' | '+'
//! operand  := variable | number
//! variable := [A-Za-z_@][A-Za-z0-9_@.]*
//! number   := digits ('.' digits)?
//! ```
//!
//! Chains are evaluated strictly left to right: `a + b * c` is
//! `(a + b) * c`. Variables in calculation rules name declared inputs;
//! in formula aggregates they are paths into the target document.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

/// Errors produced while parsing a formula string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("formula is empty")]
    Empty,
    #[error("unexpected character '{ch}' at offset {offset}")]
    UnexpectedChar { ch: char, offset: usize },
    #[error("expected a variable or number at offset {offset}")]
    ExpectedOperand { offset: usize },
    #[error("expected '*' or '+' at offset {offset}")]
    ExpectedOperator { offset: usize },
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Mul,
    Add,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::Mul => write!(f, "*"),
            Operator::Add => write!(f, "+"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Variable(String),
    Number(Decimal),
}

/// Parsed formula: a first operand followed by a left-associative chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub first: Operand,
    pub rest: Vec<(Operator, Operand)>,
    source: String,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Formula, FormulaError> {
        let tokens = tokenize(text)?;
        let mut iter = tokens.into_iter();

        let first = match iter.next() {
            None => return Err(FormulaError::Empty),
            Some((Token::Operand(op), _)) => op,
            Some((Token::Op(_), offset)) => return Err(FormulaError::ExpectedOperand { offset }),
        };

        let mut rest = Vec::new();
        while let Some((token, offset)) = iter.next() {
            let op = match token {
                Token::Op(op) => op,
                Token::Operand(_) => return Err(FormulaError::ExpectedOperator { offset }),
            };
            match iter.next() {
                Some((Token::Operand(operand), _)) => rest.push((op, operand)),
                Some((Token::Op(_), offset)) => {
                    return Err(FormulaError::ExpectedOperand { offset })
                }
                None => {
                    return Err(FormulaError::ExpectedOperand {
                        offset: text.len(),
                    })
                }
            }
        }

        Ok(Formula {
            first,
            rest,
            source: text.trim().to_string(),
        })
    }

    /// The formula as written in the rule document.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// All variable names referenced, in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(&self.first)
            .chain(self.rest.iter().map(|(_, operand)| operand))
            .filter_map(|operand| match operand {
                Operand::Variable(name) => Some(name.as_str()),
                Operand::Number(_) => None,
            })
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Tokenizer ───────────────────────────────────────────────────────

enum Token {
    Operand(Operand),
    Op(Operator),
}

fn is_var_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '@'
}

fn is_var_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '@' || c == '.'
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '*' {
            chars.next();
            tokens.push((Token::Op(Operator::Mul), offset));
        } else if c == '+' {
            chars.next();
            tokens.push((Token::Op(Operator::Add), offset));
        } else if c.is_ascii_digit() {
            let mut literal = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    literal.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let n = Decimal::from_str(&literal)
                .map_err(|_| FormulaError::InvalidNumber(literal.clone()))?;
            tokens.push((Token::Operand(Operand::Number(n)), offset));
        } else if is_var_start(c) {
            let mut name = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if is_var_continue(d) {
                    name.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push((Token::Operand(Operand::Variable(name)), offset));
        } else {
            return Err(FormulaError::UnexpectedChar { ch: c, offset });
        }
    }

    Ok(tokens)
}
