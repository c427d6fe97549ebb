#![forbid(unsafe_code)]

//! LDAP-style filter language.
//!
//! ```text
//! filter   := '(' body ')' | item
//! body     := '&' filter+ | '|' filter+ | '!' filter | item
//! item     := attr ('=' | '>=' | '<=') value
//! ```
//!
//! `attr=*` tests for presence. A backslash escapes the following character
//! inside a value. A single comparison may omit the surrounding parentheses.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Comparison operator of a filter item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    /// `attr=value`
    Eq,
    /// `attr>=value`
    Ge,
    /// `attr<=value`
    Le,
}

impl CompareOp {
    /// Operator text in both the filter language and SQL.
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        }
    }
}

/// Parsed filter expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Every child matches.
    And(Vec<Filter>),
    /// At least one child matches.
    Or(Vec<Filter>),
    /// The child does not match.
    Not(Box<Filter>),
    /// The attribute has a value.
    Present {
        /// Attribute name.
        attr: String,
    },
    /// The attribute compares to a literal.
    Compare {
        /// Attribute name.
        attr: String,
        /// Comparison operator.
        op: CompareOp,
        /// Unescaped literal text.
        value: String,
    },
}

impl Filter {
    /// `attr=value`
    pub fn eq(attr: impl Into<String>, value: impl ToString) -> Self {
        Self::compare(attr, CompareOp::Eq, value)
    }

    /// `attr>=value`
    pub fn ge(attr: impl Into<String>, value: impl ToString) -> Self {
        Self::compare(attr, CompareOp::Ge, value)
    }

    /// `attr<=value`
    pub fn le(attr: impl Into<String>, value: impl ToString) -> Self {
        Self::compare(attr, CompareOp::Le, value)
    }

    /// `attr=*`
    pub fn present(attr: impl Into<String>) -> Self {
        Filter::Present { attr: attr.into() }
    }

    fn compare(attr: impl Into<String>, op: CompareOp, value: impl ToString) -> Self {
        Filter::Compare {
            attr: attr.into(),
            op,
            value: value.to_string(),
        }
    }
}

/// Filter text that failed to parse.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{reason} at offset {offset}")]
pub struct FilterError {
    /// Byte offset of the failure.
    pub offset: usize,
    /// What was expected.
    pub reason: String,
}

/// Parses filter text.
pub fn parse(text: &str) -> Result<Filter, FilterError> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
    };
    parser.skip_ws();
    let filter = if parser.peek() == Some(b'(') {
        parser.filter()?
    } else {
        parser.item(false)?
    };
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.error("trailing characters after filter"));
    }
    Ok(filter)
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn error(&self, reason: impl Into<String>) -> FilterError {
        FilterError {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterError> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                self.skip_ws();
                Filter::Not(Box::new(self.filter()?))
            }
            _ => self.item(true)?,
        };
        self.skip_ws();
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut children = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() != Some(b'(') {
                break;
            }
            children.push(self.filter()?);
        }
        if children.is_empty() {
            return Err(self.error("expected at least one nested filter"));
        }
        Ok(children)
    }

    fn item(&mut self, nested: bool) -> Result<Filter, FilterError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("expected attribute name"));
        }
        let attr = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
        let op = match (self.peek(), self.src.get(self.pos + 1).copied()) {
            (Some(b'>'), Some(b'=')) => {
                self.pos += 2;
                CompareOp::Ge
            }
            (Some(b'<'), Some(b'=')) => {
                self.pos += 2;
                CompareOp::Le
            }
            (Some(b'='), _) => {
                self.pos += 1;
                CompareOp::Eq
            }
            _ => return Err(self.error("expected '=', '>=' or '<='")),
        };

        let value_start = self.pos;
        let mut value = Vec::new();
        let mut wildcard = false;
        while let Some(byte) = self.peek() {
            match byte {
                b')' | b'(' if nested => break,
                b'\\' => {
                    let escaped = self
                        .src
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.error("dangling escape"))?;
                    value.push(escaped);
                    self.pos += 2;
                }
                b'*' => {
                    wildcard = true;
                    value.push(byte);
                    self.pos += 1;
                }
                _ => {
                    value.push(byte);
                    self.pos += 1;
                }
            }
        }
        if wildcard {
            let raw = &self.src[value_start..self.pos];
            if op == CompareOp::Eq && raw == b"*" {
                return Ok(Filter::Present { attr });
            }
            return Err(FilterError {
                offset: value_start,
                reason: "wildcards are only supported as a bare presence test".into(),
            });
        }
        let value = String::from_utf8(value).map_err(|_| FilterError {
            offset: value_start,
            reason: "value is not valid UTF-8".into(),
        })?;
        Ok(Filter::Compare { attr, op, value })
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    for ch in value.chars() {
        if matches!(ch, '(' | ')' | '*' | '\\') {
            write!(f, "\\")?;
        }
        write!(f, "{ch}")?;
    }
    Ok(())
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                let sigil = if matches!(self, Filter::And(_)) { '&' } else { '|' };
                write!(f, "({sigil}")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{child})"),
            Filter::Present { attr } => write!(f, "({attr}=*)"),
            Filter::Compare { attr, op, value } => {
                write!(f, "({attr}{}", op.symbol())?;
                write_escaped(f, value)?;
                write!(f, ")")
            }
        }
    }
}
