#![forbid(unsafe_code)]

use std::fmt;

use ctu_ast::Span;

#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Keywords
    KwDef,
    KwStruct,
    KwUnion,
    KwEnum,
    KwUsing,
    KwLet,
    KwVar,
    KwIf,
    KwElse,
    KwFor,
    KwWhile,
    KwSwitch,
    KwCase,
    KwReturn,
    KwBreak,
    KwContinue,
    KwConst,
    KwTrue,
    KwFalse,
    KwNull,
    /// `cast!`
    KwCast,
    /// `unwrap!`
    KwUnwrap,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    AndAnd,
    OrOr,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Neq,
    Eq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    PipeEq,
    CaretEq,
    ShlEq,
    ShrEq,
    Question,
    /// `?:`
    Elvis,
    /// `!<`
    TemplateOpen,
    Arrow,
    FatArrow,
    ColonColon,
    DotDot,
    Dot,

    // Punctuation
    Colon,
    Semi,
    Comma,
    At,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,

    // Literals / identifiers
    Ident(String),
    /// Digits with prefix and `_` separators removed.
    Int { digits: String, radix: u32 },
    Float(String),
    String(String),

    Eof,
}

/// Coarse token classes used when describing tokens in diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenClass {
    Keyword,
    Identifier,
    StringLiteral,
    IntLiteral,
    FloatLiteral,
    Operator,
    Punctuation,
    End,
}

impl TokenKind {
    pub fn class(&self) -> TokenClass {
        use TokenKind::*;
        match self {
            KwDef | KwStruct | KwUnion | KwEnum | KwUsing | KwLet | KwVar | KwIf | KwElse
            | KwFor | KwWhile | KwSwitch | KwCase | KwReturn | KwBreak | KwContinue | KwConst
            | KwTrue | KwFalse | KwNull | KwCast | KwUnwrap => TokenClass::Keyword,
            Ident(_) => TokenClass::Identifier,
            String(_) => TokenClass::StringLiteral,
            Int { .. } => TokenClass::IntLiteral,
            Float(_) => TokenClass::FloatLiteral,
            Colon | Semi | Comma | At | LParen | RParen | LBrace | RBrace | LBracket
            | RBracket => TokenClass::Punctuation,
            Eof => TokenClass::End,
            _ => TokenClass::Operator,
        }
    }

    /// Source spelling for fixed tokens.
    pub fn symbol(&self) -> Option<&'static str> {
        use TokenKind::*;
        let s = match self {
            KwDef => "def",
            KwStruct => "struct",
            KwUnion => "union",
            KwEnum => "enum",
            KwUsing => "using",
            KwLet => "let",
            KwVar => "var",
            KwIf => "if",
            KwElse => "else",
            KwFor => "for",
            KwWhile => "while",
            KwSwitch => "switch",
            KwCase => "case",
            KwReturn => "return",
            KwBreak => "break",
            KwContinue => "continue",
            KwConst => "const",
            KwTrue => "true",
            KwFalse => "false",
            KwNull => "null",
            KwCast => "cast!",
            KwUnwrap => "unwrap!",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Percent => "%",
            Amp => "&",
            Pipe => "|",
            Caret => "^",
            Tilde => "~",
            Bang => "!",
            AndAnd => "&&",
            OrOr => "||",
            Shl => "<<",
            Shr => ">>",
            Lt => "<",
            Gt => ">",
            Le => "<=",
            Ge => ">=",
            EqEq => "==",
            Neq => "!=",
            Eq => "=",
            PlusEq => "+=",
            MinusEq => "-=",
            StarEq => "*=",
            SlashEq => "/=",
            PercentEq => "%=",
            AmpEq => "&=",
            PipeEq => "|=",
            CaretEq => "^=",
            ShlEq => "<<=",
            ShrEq => ">>=",
            Question => "?",
            Elvis => "?:",
            TemplateOpen => "!<",
            Arrow => "->",
            FatArrow => "=>",
            ColonColon => "::",
            DotDot => "..",
            Dot => ".",
            Colon => ":",
            Semi => ";",
            Comma => ",",
            At => "@",
            LParen => "(",
            RParen => ")",
            LBrace => "{",
            RBrace => "}",
            LBracket => "[",
            RBracket => "]",
            Ident(_) | Int { .. } | Float(_) | String(_) | Eof => return None,
        };
        Some(s)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sym) = self.symbol() {
            return write!(f, "`{sym}`");
        }
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{name}`"),
            TokenKind::Int { digits, .. } => write!(f, "integer literal `{digits}`"),
            TokenKind::Float(text) => write!(f, "float literal `{text}`"),
            TokenKind::String(_) => f.write_str("string literal"),
            _ => f.write_str("end of input"),
        }
    }
}
