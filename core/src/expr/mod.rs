//! Expression parsing for measures and SQL source extraction.

pub mod lexer;
pub mod measure;
pub mod parser;
pub mod sources;

pub use measure::{validate_measure, MeasureCheck, MeasureError, AGGREGATE_FUNCTIONS};
pub use parser::{parse_expression, BinaryOp, Expr, LiteralValue};
pub use sources::{referenced_tables, sanitize_query};

use thiserror::Error;

use lexer::Token;

/// Parse failure with the offending token and its 0-based byte offset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {offset} near '{token}'")]
pub struct SyntaxError {
    pub message: String,
    pub token: String,
    pub offset: usize,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, token: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            token: token.into(),
            offset,
        }
    }

    pub(crate) fn unexpected(token: &Token) -> Self {
        Self::new("unexpected token", token.text.clone(), token.offset)
    }

    /// 1-based (line, column) of the error within `source`.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let offset = self.offset.min(source.len());
        let before = source.get(..offset).unwrap_or(source);
        let line = before.matches('\n').count() + 1;
        let col = match before.rfind('\n') {
            Some(nl) => before[nl + 1..].chars().count() + 1,
            None => before.chars().count() + 1,
        };
        (line, col)
    }
}
