#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use std::fmt;

use ctu_ast::{Position, Span};
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
#[error("unresolved name `{name}` at {position}")]
#[diagnostic(code(ctu::validate))]
#[allow(unused_assignments)]
pub struct UnresolvedNameError {
    pub name: String,
    pub position: Position,
    #[label("not declared in any enclosing scope")]
    pub span: SourceSpan,
}

impl UnresolvedNameError {
    pub fn new(name: impl Into<String>, at: Span) -> Self {
        Self {
            name: name.into(),
            position: at.start,
            span: at.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoweringErrorKind {
    CyclicAlias,
    CyclicAggregate,
    TemplateArity,
    Unrepresentable,
    IntegerOutOfRange,
    ArgumentCount,
    UninferableType,
    UnknownMember,
}

impl LoweringErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoweringErrorKind::CyclicAlias => "cyclic alias",
            LoweringErrorKind::CyclicAggregate => "cyclic aggregate",
            LoweringErrorKind::TemplateArity => "template arity",
            LoweringErrorKind::Unrepresentable => "unrepresentable",
            LoweringErrorKind::IntegerOutOfRange => "integer out of range",
            LoweringErrorKind::ArgumentCount => "argument count",
            LoweringErrorKind::UninferableType => "uninferable type",
            LoweringErrorKind::UnknownMember => "unknown member",
        }
    }
}

impl fmt::Display for LoweringErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("lowering error ({kind}) at {position}: {message}")]
#[diagnostic(code(ctu::lower))]
#[allow(unused_assignments)]
pub struct LoweringError {
    pub kind: LoweringErrorKind,
    pub message: String,
    pub position: Position,
    #[label]
    pub span: SourceSpan,
}

impl LoweringError {
    pub fn new(kind: LoweringErrorKind, message: impl Into<String>, at: Span) -> Self {
        Self {
            kind,
            message: message.into(),
            position: at.start,
            span: at.into(),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(ctu::lower::decorator), severity(Warning))]
#[allow(unused_assignments)]
pub struct LoweringWarning {
    pub message: String,
    pub position: Position,
    #[label]
    pub span: SourceSpan,
}

impl LoweringWarning {
    pub fn new(message: impl Into<String>, at: Span) -> Self {
        Self {
            message: message.into(),
            position: at.start,
            span: at.into(),
        }
    }
}
