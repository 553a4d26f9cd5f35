#![forbid(unsafe_code)]

mod error;
mod parser;

use ctu_lex::{Lexer, Token};

pub use error::ParseError;
pub use parser::Parser;

/// Parses a token stream into a unit plus every recovered error.
///
/// The returned unit is best-effort when errors are present and must not be
/// lowered.
pub fn parse(tokens: Vec<Token>) -> (ctu_ast::Unit, Vec<ParseError>) {
    Parser::new(tokens).parse_unit()
}

/// Lexes and parses `src`, failing on the first lex or parse error.
pub fn parse_source(src: &str) -> miette::Result<ctu_ast::Unit> {
    let (unit, mut errors) = parse_source_with_recovery(src)?;
    if errors.is_empty() {
        Ok(unit)
    } else {
        Err(miette::Report::new(errors.remove(0)))
    }
}

/// Lexes and parses `src`, collecting parse errors instead of stopping.
pub fn parse_source_with_recovery(src: &str) -> miette::Result<(ctu_ast::Unit, Vec<ParseError>)> {
    let tokens = Lexer::new(src).lex()?;
    Ok(parse(tokens))
}

pub fn parse_expr(src: &str) -> miette::Result<ctu_ast::Expr> {
    let tokens = Lexer::new(src).lex()?;
    Ok(Parser::new(tokens).parse_expr_eof()?)
}

pub fn parse_type(src: &str) -> miette::Result<ctu_ast::TypeExpr> {
    let tokens = Lexer::new(src).lex()?;
    Ok(Parser::new(tokens).parse_type_eof()?)
}
