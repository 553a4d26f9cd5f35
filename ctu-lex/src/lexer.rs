#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use ctu_ast::{Position, Span};
use logos::Logos;
use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("lex error at {position}: {message}")]
#[diagnostic(code(ctu::lex))]
#[allow(unused_assignments)]
pub struct LexError {
    pub message: String,
    /// First character of the rejected input.
    pub character: char,
    pub position: Position,
    #[label]
    pub span: SourceSpan,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum RawToken {
    #[token("def")]
    KwDef,
    #[token("struct")]
    KwStruct,
    #[token("union")]
    KwUnion,
    #[token("enum")]
    KwEnum,
    #[token("using")]
    KwUsing,
    #[token("let")]
    KwLet,
    #[token("var")]
    KwVar,
    #[token("if")]
    KwIf,
    #[token("else")]
    KwElse,
    #[token("for")]
    KwFor,
    #[token("while")]
    KwWhile,
    #[token("switch")]
    KwSwitch,
    #[token("case")]
    KwCase,
    #[token("return")]
    KwReturn,
    #[token("break")]
    KwBreak,
    #[token("continue")]
    KwContinue,
    #[token("const")]
    KwConst,
    #[token("true")]
    KwTrue,
    #[token("false")]
    KwFalse,
    #[token("null")]
    KwNull,
    #[token("cast!")]
    KwCast,
    #[token("unwrap!")]
    KwUnwrap,

    #[token("<<=")]
    ShlEq,
    #[token(">>=")]
    ShrEq,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Neq,
    #[token("=>")]
    FatArrow,
    #[token("=")]
    Eq,
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("*=")]
    StarEq,
    #[token("/=")]
    SlashEq,
    #[token("%=")]
    PercentEq,
    #[token("&=")]
    AmpEq,
    #[token("|=")]
    PipeEq,
    #[token("^=")]
    CaretEq,

    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!<")]
    TemplateOpen,
    #[token("!")]
    Bang,
    #[token("?:")]
    Elvis,
    #[token("?")]
    Question,
    #[token("->")]
    Arrow,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,

    #[token("::")]
    ColonColon,
    #[token(":")]
    Colon,
    #[token("..")]
    DotDot,
    #[token(".")]
    Dot,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("@")]
    At,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    #[regex(r"0b[01_]+", |lex| int_digits(lex.slice(), 2))]
    #[regex(r"0o[0-7_]+", |lex| int_digits(lex.slice(), 8))]
    #[regex(r"0x[0-9a-fA-F_]+", |lex| int_digits(lex.slice(), 16))]
    #[regex(r"[0-9][0-9_]*", |lex| int_digits(lex.slice(), 10))]
    Int(Option<(String, u32)>),

    #[regex(r"[0-9][0-9_]*\.[0-9][0-9_]*([eE][+-]?[0-9]+)?", |lex| strip_underscores(lex.slice()))]
    Float(Option<String>),

    // Supported escapes: \n, \t, \r, \0, \", \\, and \u{HEX} (1-6 hex digits)
    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    String(Option<String>),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Keeps the literal as text so that values wider than 64 bits survive
/// until lowering narrows them to a concrete type.
fn int_digits(s: &str, radix: u32) -> Option<(String, u32)> {
    let body = if radix == 10 { s } else { s.get(2..)? };
    let digits = strip_underscores(body)?;
    Some((digits, radix))
}

fn strip_underscores(s: &str) -> Option<String> {
    if s.is_empty() {
        return None;
    }
    if s.starts_with('_') || s.ends_with('_') || s.contains("__") || s.contains("_.") || s.contains("._") {
        return None;
    }
    Some(s.replace('_', ""))
}

fn parse_string(lex: &mut logos::Lexer<RawToken>) -> Option<String> {
    let s = lex.slice();
    let inner = &s[1..s.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        let esc = chars.next()?;
        match esc {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            'u' => {
                if chars.next() != Some('{') {
                    return None;
                }
                let mut hex = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        break;
                    }
                    hex.push(ch);
                    chars.next();
                    if hex.len() > 6 {
                        return None;
                    }
                }
                if chars.next() != Some('}') || hex.is_empty() {
                    return None;
                }
                let cp = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(cp)?);
            }
            _ => return None,
        }
    }

    Some(out)
}

/// Maps byte offsets to line/column positions.
#[derive(Clone, Debug)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(src: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(src.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    pub fn position(&self, src: &str, offset: usize) -> Position {
        let line = self.starts.partition_point(|&s| s <= offset).saturating_sub(1);
        let line_start = self.starts.get(line).copied().unwrap_or(0);
        let column = src
            .get(line_start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(0);
        Position {
            offset,
            line: line as u32 + 1,
            column: column as u32 + 1,
        }
    }
}

/// Lazy token stream over one source text.
///
/// Iteration stops after the first error. [`Lexer::restart`] rewinds to the
/// start of the source; there is no other way to reposition.
pub struct Lexer<'a> {
    src: &'a str,
    lines: LineIndex,
    raw: logos::Lexer<'a, RawToken>,
    /// Second half of a split `cast!=`/`unwrap!=`.
    pending: Option<Token>,
    failed: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            lines: LineIndex::new(src),
            raw: RawToken::lexer(src),
            pending: None,
            failed: false,
        }
    }

    pub fn restart(&mut self) {
        self.raw = RawToken::lexer(self.src);
        self.pending = None;
        self.failed = false;
    }

    pub fn position_at(&self, offset: usize) -> Position {
        self.lines.position(self.src, offset)
    }

    fn span(&self, start: usize, end: usize) -> Span {
        Span::new(self.position_at(start), end)
    }

    /// Lexes the whole source from the start, appending a trailing `Eof`.
    pub fn lex(&mut self) -> Result<Vec<Token>, LexError> {
        self.restart();
        let mut tokens = Vec::new();
        for tok in self.by_ref() {
            tokens.push(tok?);
        }
        let end = self.src.len();
        tokens.push(Token {
            kind: TokenKind::Eof,
            span: self.span(end, end),
        });
        Ok(tokens)
    }

    fn error(&mut self, message: impl Into<String>, start: usize, end: usize) -> LexError {
        self.failed = true;
        let position = self.position_at(start);
        LexError {
            message: message.into(),
            character: self.src[start..].chars().next().unwrap_or('\0'),
            position,
            span: SourceSpan::new(start.into(), end - start),
        }
    }
}

impl Iterator for Lexer<'_> {
    type Item = Result<Token, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(tok) = self.pending.take() {
            return Some(Ok(tok));
        }
        let raw = self.raw.next()?;
        let range = self.raw.span();
        let (start, end) = (range.start, range.end);

        let kind = match raw {
            Ok(RawToken::KwDef) => TokenKind::KwDef,
            Ok(RawToken::KwStruct) => TokenKind::KwStruct,
            Ok(RawToken::KwUnion) => TokenKind::KwUnion,
            Ok(RawToken::KwEnum) => TokenKind::KwEnum,
            Ok(RawToken::KwUsing) => TokenKind::KwUsing,
            Ok(RawToken::KwLet) => TokenKind::KwLet,
            Ok(RawToken::KwVar) => TokenKind::KwVar,
            Ok(RawToken::KwIf) => TokenKind::KwIf,
            Ok(RawToken::KwElse) => TokenKind::KwElse,
            Ok(RawToken::KwFor) => TokenKind::KwFor,
            Ok(RawToken::KwWhile) => TokenKind::KwWhile,
            Ok(RawToken::KwSwitch) => TokenKind::KwSwitch,
            Ok(RawToken::KwCase) => TokenKind::KwCase,
            Ok(RawToken::KwReturn) => TokenKind::KwReturn,
            Ok(RawToken::KwBreak) => TokenKind::KwBreak,
            Ok(RawToken::KwContinue) => TokenKind::KwContinue,
            Ok(RawToken::KwConst) => TokenKind::KwConst,
            Ok(RawToken::KwTrue) => TokenKind::KwTrue,
            Ok(RawToken::KwFalse) => TokenKind::KwFalse,
            Ok(RawToken::KwNull) => TokenKind::KwNull,
            // `cast != y` compares a name; the macro never precedes `=`.
            Ok(RawToken::KwCast | RawToken::KwUnwrap) if self.raw.remainder().starts_with('=') => {
                self.raw.bump(1);
                self.pending = Some(Token {
                    kind: TokenKind::Neq,
                    span: self.span(end - 1, end + 1),
                });
                return Some(Ok(Token {
                    kind: TokenKind::Ident(self.src[start..end - 1].to_string()),
                    span: self.span(start, end - 1),
                }));
            }
            Ok(RawToken::KwCast) => TokenKind::KwCast,
            Ok(RawToken::KwUnwrap) => TokenKind::KwUnwrap,

            Ok(RawToken::ShlEq) => TokenKind::ShlEq,
            Ok(RawToken::ShrEq) => TokenKind::ShrEq,
            Ok(RawToken::Shl) => TokenKind::Shl,
            Ok(RawToken::Shr) => TokenKind::Shr,
            Ok(RawToken::Le) => TokenKind::Le,
            Ok(RawToken::Ge) => TokenKind::Ge,
            Ok(RawToken::Lt) => TokenKind::Lt,
            Ok(RawToken::Gt) => TokenKind::Gt,
            Ok(RawToken::EqEq) => TokenKind::EqEq,
            Ok(RawToken::Neq) => TokenKind::Neq,
            Ok(RawToken::FatArrow) => TokenKind::FatArrow,
            Ok(RawToken::Eq) => TokenKind::Eq,
            Ok(RawToken::PlusEq) => TokenKind::PlusEq,
            Ok(RawToken::MinusEq) => TokenKind::MinusEq,
            Ok(RawToken::StarEq) => TokenKind::StarEq,
            Ok(RawToken::SlashEq) => TokenKind::SlashEq,
            Ok(RawToken::PercentEq) => TokenKind::PercentEq,
            Ok(RawToken::AmpEq) => TokenKind::AmpEq,
            Ok(RawToken::PipeEq) => TokenKind::PipeEq,
            Ok(RawToken::CaretEq) => TokenKind::CaretEq,

            Ok(RawToken::AndAnd) => TokenKind::AndAnd,
            Ok(RawToken::OrOr) => TokenKind::OrOr,
            Ok(RawToken::TemplateOpen) => TokenKind::TemplateOpen,
            Ok(RawToken::Bang) => TokenKind::Bang,
            Ok(RawToken::Elvis) => TokenKind::Elvis,
            Ok(RawToken::Question) => TokenKind::Question,
            Ok(RawToken::Arrow) => TokenKind::Arrow,

            Ok(RawToken::Plus) => TokenKind::Plus,
            Ok(RawToken::Minus) => TokenKind::Minus,
            Ok(RawToken::Star) => TokenKind::Star,
            Ok(RawToken::Slash) => {
                if self.raw.remainder().starts_with('*') {
                    return Some(Err(self.error("unterminated block comment", start, self.src.len())));
                }
                TokenKind::Slash
            }
            Ok(RawToken::Percent) => TokenKind::Percent,
            Ok(RawToken::Amp) => TokenKind::Amp,
            Ok(RawToken::Pipe) => TokenKind::Pipe,
            Ok(RawToken::Caret) => TokenKind::Caret,
            Ok(RawToken::Tilde) => TokenKind::Tilde,

            Ok(RawToken::ColonColon) => TokenKind::ColonColon,
            Ok(RawToken::Colon) => TokenKind::Colon,
            Ok(RawToken::DotDot) => TokenKind::DotDot,
            Ok(RawToken::Dot) => TokenKind::Dot,
            Ok(RawToken::Semi) => TokenKind::Semi,
            Ok(RawToken::Comma) => TokenKind::Comma,
            Ok(RawToken::At) => TokenKind::At,

            Ok(RawToken::LParen) => TokenKind::LParen,
            Ok(RawToken::RParen) => TokenKind::RParen,
            Ok(RawToken::LBrace) => TokenKind::LBrace,
            Ok(RawToken::RBrace) => TokenKind::RBrace,
            Ok(RawToken::LBracket) => TokenKind::LBracket,
            Ok(RawToken::RBracket) => TokenKind::RBracket,

            Ok(RawToken::Ident(s)) => TokenKind::Ident(s),
            Ok(RawToken::Int(Some((digits, radix)))) => TokenKind::Int { digits, radix },
            Ok(RawToken::Int(None)) => {
                return Some(Err(self.error("invalid integer literal", start, end)));
            }
            Ok(RawToken::Float(Some(text))) => TokenKind::Float(text),
            Ok(RawToken::Float(None)) => {
                return Some(Err(self.error("invalid float literal", start, end)));
            }
            Ok(RawToken::String(Some(s))) => TokenKind::String(s),
            Ok(RawToken::String(None)) => {
                return Some(Err(self.error("invalid string literal", start, end)));
            }

            Err(()) => {
                let ch = self.src[start..].chars().next().unwrap_or('\0');
                return Some(Err(self.error(format!("unrecognized character `{ch}`"), start, end)));
            }
        };

        Some(Ok(Token {
            kind,
            span: self.span(start, end),
        }))
    }
}
