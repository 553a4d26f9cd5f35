#![forbid(unsafe_code)]

//! Compiles ctu units to C: lex, parse, validate scopes, lower, emit.
//!
//! [`compile`] is the whole pipeline for one unit. The CLI in `main.rs` only
//! reads files, calls [`compile_units`] and renders what comes back.

pub mod config;

use std::fmt;

use ctu_ast::Position;
use ctu_core::{LoweringError, LoweringWarning, UnresolvedNameError};
use ctu_lex::LexError;
use ctu_parse::ParseError;
use miette::{LabeledSpan, SourceSpan};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info_span};

pub use config::{CompileOptions, ConfigError};
pub use ctu_backend_c::EmitOptions;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        })
    }
}

/// The pipeline stage that produced a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Lex,
    Parse,
    Validate,
    Lower,
}

impl Stage {
    fn code(self) -> &'static str {
        match self {
            Stage::Lex => "ctu::lex",
            Stage::Parse => "ctu::parse",
            Stage::Validate => "ctu::validate",
            Stage::Lower => "ctu::lower",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Lex => "lex",
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::Lower => "lower",
        })
    }
}

/// One stage-tagged message about a unit.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{stage} {severity} at {position}: {message}")]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: Stage,
    pub position: Position,
    pub message: String,
    pub span: SourceSpan,
}

impl Diagnostic {
    fn error(stage: Stage, position: Position, span: SourceSpan, message: String) -> Self {
        Self {
            severity: Severity::Error,
            stage,
            position,
            message,
            span,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl miette::Diagnostic for Diagnostic {
    fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
        Some(Box::new(self.stage.code()))
    }

    fn severity(&self) -> Option<miette::Severity> {
        Some(match self.severity {
            Severity::Error => miette::Severity::Error,
            Severity::Warning => miette::Severity::Warning,
        })
    }

    fn labels(&self) -> Option<Box<dyn Iterator<Item = LabeledSpan> + '_>> {
        Some(Box::new(std::iter::once(LabeledSpan::new_with_span(None, self.span))))
    }
}

impl From<LexError> for Diagnostic {
    fn from(e: LexError) -> Self {
        Self::error(Stage::Lex, e.position, e.span, e.message)
    }
}

impl From<ParseError> for Diagnostic {
    fn from(e: ParseError) -> Self {
        let message = format!("expected {}, found {}", e.expected, e.found);
        Self::error(Stage::Parse, e.position, e.span, message)
    }
}

impl From<UnresolvedNameError> for Diagnostic {
    fn from(e: UnresolvedNameError) -> Self {
        let message = format!("unresolved name `{}`", e.name);
        Self::error(Stage::Validate, e.position, e.span, message)
    }
}

impl From<LoweringError> for Diagnostic {
    fn from(e: LoweringError) -> Self {
        let message = format!("{}: {}", e.kind, e.message);
        Self::error(Stage::Lower, e.position, e.span, message)
    }
}

impl From<LoweringWarning> for Diagnostic {
    fn from(w: LoweringWarning) -> Self {
        Self {
            severity: Severity::Warning,
            stage: Stage::Lower,
            position: w.position,
            message: w.message,
            span: w.span,
        }
    }
}

/// C text for one unit plus the warnings raised while producing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compiled {
    pub c_source: String,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub source: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Compiles one unit with default options, dropping warnings.
pub fn compile(unit_name: &str, source: &str) -> Result<String, Vec<Diagnostic>> {
    compile_with(unit_name, source, &CompileOptions::default()).map(|c| c.c_source)
}

/// Runs the full pipeline over `source`.
///
/// Either returns C text with any warnings, or a non-empty list of errors and
/// no text. Parse errors and unresolved names are collected together before
/// giving up; lex and lowering errors stop at the first one.
pub fn compile_with(
    unit_name: &str,
    source: &str,
    options: &CompileOptions,
) -> Result<Compiled, Vec<Diagnostic>> {
    let _span = info_span!("compile", unit = unit_name).entered();

    let tokens = ctu_lex::tokenize(source)
        .lex()
        .map_err(|e| vec![Diagnostic::from(e)])?;
    debug!(tokens = tokens.len(), "lexed");

    let (unit, parse_errors) = ctu_parse::parse(tokens);
    debug!(decls = unit.decls.len(), errors = parse_errors.len(), "parsed");

    let unresolved = ctu_core::validate(&unit);
    debug!(errors = unresolved.len(), "validated");

    if !parse_errors.is_empty() || !unresolved.is_empty() {
        let mut diagnostics: Vec<Diagnostic> = parse_errors.into_iter().map(Diagnostic::from).collect();
        diagnostics.extend(unresolved.into_iter().map(Diagnostic::from));
        return Err(diagnostics);
    }

    let lowered = ctu_core::lower(&unit, unit_name).map_err(|e| vec![Diagnostic::from(e)])?;
    debug!(
        functions = lowered.module.functions.len(),
        aggregates = lowered.module.aggregates.len(),
        warnings = lowered.warnings.len(),
        "lowered"
    );

    let c_source = ctu_backend_c::emit(&lowered.module, &options.emit);
    debug!(bytes = c_source.len(), "emitted");

    Ok(Compiled {
        c_source,
        warnings: lowered.warnings.into_iter().map(Diagnostic::from).collect(),
    })
}

/// Compiles independent units in parallel. Results keep the input order.
pub fn compile_units(
    units: &[SourceUnit],
    options: &CompileOptions,
) -> Vec<(String, Result<Compiled, Vec<Diagnostic>>)> {
    units
        .par_iter()
        .map(|u| (u.name.clone(), compile_with(&u.name, &u.source, options)))
        .collect()
}
