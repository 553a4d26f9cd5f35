#![forbid(unsafe_code)]

mod lexer;
mod token;

pub use lexer::{LexError, Lexer, LineIndex};
pub use token::{Token, TokenClass, TokenKind};

/// Lazily tokenizes `src`; see [`Lexer`].
pub fn tokenize(src: &str) -> Lexer<'_> {
    Lexer::new(src)
}
