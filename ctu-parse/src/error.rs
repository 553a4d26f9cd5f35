#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use ctu_ast::{Position, Span};
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("parse error at {position}: expected {expected}, found {found}")]
#[diagnostic(code(ctu::parse))]
#[allow(unused_assignments)]
pub struct ParseError {
    pub expected: String,
    pub found: String,
    pub position: Position,
    #[label("expected {expected}")]
    pub span: SourceSpan,
}

impl ParseError {
    pub fn new(expected: impl Into<String>, found: impl Into<String>, at: Span) -> Self {
        Self {
            expected: expected.into(),
            found: found.into(),
            position: at.start,
            span: at.into(),
        }
    }
}
