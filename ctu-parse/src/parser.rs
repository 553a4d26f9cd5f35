#![forbid(unsafe_code)]

use std::mem;

use ctu_ast::{
    AliasDecl, Arg, BinOp, Block, Branch, BuiltinType, Capability, CondPath, Decl, Decorator, EnumDecl,
    EnumMember, Expr, ExprKind, Field, ForCStyle, ForRange, FunctionBody, FunctionDecl, Ident, Include,
    ReturnStmt, Span, Stmt, StructDecl, SwitchCase, SwitchStmt, TypeExpr, TypeKind, UnaryOp, UnionDecl,
    Unit, VarBinding, VarDecl, WhileStmt,
};
use ctu_lex::{Token, TokenKind};

use crate::error::ParseError;

/// Binary precedence levels, loosest first. Level `UNARY_LEVEL` hands off to
/// prefix operators.
const UNARY_LEVEL: u8 = 10;

fn binary_op(level: u8, kind: &TokenKind) -> Option<BinOp> {
    use TokenKind as T;
    let op = match (level, kind) {
        (0, T::OrOr) => BinOp::Or,
        (1, T::AndAnd) => BinOp::And,
        (2, T::Pipe) => BinOp::BitOr,
        (3, T::Caret) => BinOp::BitXor,
        (4, T::Amp) => BinOp::BitAnd,
        (5, T::EqEq) => BinOp::Eq,
        (5, T::Neq) => BinOp::Ne,
        (6, T::Lt) => BinOp::Lt,
        (6, T::Gt) => BinOp::Gt,
        (6, T::Le) => BinOp::Le,
        (6, T::Ge) => BinOp::Ge,
        (7, T::Shl) => BinOp::Shl,
        (7, T::Shr) => BinOp::Shr,
        (8, T::Plus) => BinOp::Add,
        (8, T::Minus) => BinOp::Sub,
        (9, T::Star) => BinOp::Mul,
        (9, T::Slash) => BinOp::Div,
        (9, T::Percent) => BinOp::Rem,
        _ => return None,
    };
    Some(op)
}

fn assign_op(kind: &TokenKind) -> Option<BinOp> {
    use TokenKind as T;
    let op = match kind {
        T::Eq => BinOp::Assign,
        T::PlusEq => BinOp::AddAssign,
        T::MinusEq => BinOp::SubAssign,
        T::StarEq => BinOp::MulAssign,
        T::SlashEq => BinOp::DivAssign,
        T::PercentEq => BinOp::RemAssign,
        T::AmpEq => BinOp::AndAssign,
        T::PipeEq => BinOp::OrAssign,
        T::CaretEq => BinOp::XorAssign,
        T::ShlEq => BinOp::ShlAssign,
        T::ShrEq => BinOp::ShrAssign,
        _ => return None,
    };
    Some(op)
}

pub struct Parser {
    tokens: Vec<Token>,
    idx: usize,
    errors: Vec<ParseError>,
}

impl Parser {
    /// `tokens` should end with `Eof`; one is appended if missing.
    pub fn new(mut tokens: Vec<Token>) -> Self {
        if !matches!(tokens.last(), Some(Token { kind: TokenKind::Eof, .. })) {
            let span = tokens
                .last()
                .map(|t| Span::new(t.span.start, t.span.end))
                .unwrap_or_default();
            tokens.push(Token {
                kind: TokenKind::Eof,
                span,
            });
        }
        Self {
            tokens,
            idx: 0,
            errors: Vec::new(),
        }
    }

    /// Parses a whole unit, recovering at declaration and statement
    /// boundaries so every independent error is reported.
    pub fn parse_unit(&mut self) -> (Unit, Vec<ParseError>) {
        let mut decls = Vec::new();
        while !self.at(TokenKind::Eof) {
            let decl_start = self.idx;
            match self.parse_decl() {
                Ok(decl) => decls.push(decl),
                Err(err) => {
                    let start = self.idx;
                    self.errors.push(err);
                    let open = self.open_braces_since(decl_start);
                    if open > 0 {
                        self.skip_past_closing_braces(open);
                        continue;
                    }
                    self.recover_to_boundary();
                    // A stray `}` at top level.
                    if self.idx == start {
                        self.next();
                    }
                }
            }
        }
        (Unit { decls }, mem::take(&mut self.errors))
    }

    pub fn parse_expr_eof(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if !self.at(TokenKind::Eof) {
            return Err(self.error_here("end of input"));
        }
        Ok(expr)
    }

    pub fn parse_type_eof(&mut self) -> Result<TypeExpr, ParseError> {
        let ty = self.parse_type()?;
        if !self.at(TokenKind::Eof) {
            return Err(self.error_here("end of input"));
        }
        Ok(ty)
    }

    /// Skips to just past the next `;`, or up to (not past) a `}` that closes
    /// the enclosing block. A brace-delimited body encountered on the way is
    /// skipped whole.
    fn recover_to_boundary(&mut self) {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Semi if depth == 0 => {
                    self.next();
                    break;
                }
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                    if depth == 0 {
                        self.next();
                        break;
                    }
                }
                _ => {}
            }
            self.next();
        }
    }

    /// Braces consumed since token `from` that are still unclosed.
    fn open_braces_since(&self, from: usize) -> usize {
        self.tokens[from..self.idx]
            .iter()
            .fold(0, |depth, tok| match tok.kind {
                TokenKind::LBrace => depth + 1,
                TokenKind::RBrace => depth.saturating_sub(1),
                _ => depth,
            })
    }

    fn skip_past_closing_braces(&mut self, mut open: usize) {
        while open > 0 {
            match self.peek() {
                TokenKind::Eof => return,
                TokenKind::LBrace => open += 1,
                TokenKind::RBrace => open -= 1,
                _ => {}
            }
            self.next();
        }
    }

    // -----------------------------------------------------------------------
    // Declarations
    // -----------------------------------------------------------------------

    fn parse_decl(&mut self) -> Result<Decl, ParseError> {
        let decorators = self.parse_decorators()?;
        let decl = match self.peek() {
            TokenKind::KwStruct => Decl::Struct(self.parse_struct(decorators)?),
            TokenKind::KwUnion => Decl::Union(self.parse_union(decorators)?),
            TokenKind::KwEnum => Decl::Enum(self.parse_enum(decorators)?),
            TokenKind::KwDef => Decl::Function(self.parse_function(decorators)?),
            _ if !decorators.is_empty() => {
                return Err(self.error_here("`def`, `struct`, `union` or `enum` after decorators"));
            }
            TokenKind::KwUsing => self.parse_using()?,
            TokenKind::KwLet | TokenKind::KwVar => {
                let var = self.parse_var_decl()?;
                self.expect(TokenKind::Semi)?;
                Decl::Global(var)
            }
            _ => return Err(self.error_here("declaration")),
        };
        Ok(decl)
    }

    fn parse_decorators(&mut self) -> Result<Vec<Decorator>, ParseError> {
        let mut out = Vec::new();
        while self.at(TokenKind::At) {
            let at = self.next();
            if self.eat(TokenKind::LBracket).is_some() {
                loop {
                    out.push(self.parse_decorator_body(at.span)?);
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket)?;
            } else {
                out.push(self.parse_decorator_body(at.span)?);
            }
        }
        Ok(out)
    }

    fn parse_decorator_body(&mut self, at: Span) -> Result<Decorator, ParseError> {
        let name = self.expect_ident()?;
        let args = if self.eat(TokenKind::LParen).is_some() {
            self.parse_call_args()?
        } else {
            Vec::new()
        };
        Ok(Decorator {
            span: at.to(self.prev_span()),
            name,
            args,
        })
    }

    /// `using Name = type;` or `using a::b (=> alias)? ((items))? ;`
    fn parse_using(&mut self) -> Result<Decl, ParseError> {
        let kw = self.expect(TokenKind::KwUsing)?;
        let path = self.parse_path()?;

        if path.len() == 1 && self.eat(TokenKind::Eq).is_some() {
            let target = self.parse_type()?;
            self.expect(TokenKind::Semi)?;
            let name = path.into_iter().next().ok_or_else(|| self.error_here("alias name"))?;
            return Ok(Decl::Alias(AliasDecl {
                span: kw.span.to(self.prev_span()),
                name,
                target,
            }));
        }

        let alias = if self.eat(TokenKind::FatArrow).is_some() {
            Some(self.expect_ident()?)
        } else {
            None
        };
        let mut items = Vec::new();
        if self.eat(TokenKind::LParen).is_some() {
            if !self.at(TokenKind::RParen) {
                loop {
                    items.push(self.expect_ident()?);
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
        }
        self.expect(TokenKind::Semi)?;
        Ok(Decl::Include(Include {
            span: kw.span.to(self.prev_span()),
            path,
            items,
            alias,
        }))
    }

    fn parse_struct(&mut self, decorators: Vec<Decorator>) -> Result<StructDecl, ParseError> {
        let kw = self.expect(TokenKind::KwStruct)?;
        let name = self.expect_ident()?;
        let params = self.parse_template_params()?;

        let mut capabilities = Vec::new();
        if self.eat(TokenKind::Colon).is_some() {
            if self.eat(TokenKind::LParen).is_some() {
                loop {
                    let label = self.expect_ident()?;
                    self.expect(TokenKind::Eq)?;
                    let base = self.parse_type()?;
                    capabilities.push(Capability {
                        span: label.span.to(base.span),
                        label,
                        base,
                    });
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
                self.expect(TokenKind::RParen)?;
            } else {
                let base = self.parse_type()?;
                let label = match &base.kind {
                    TypeKind::Named(path) | TypeKind::Template { base: path, .. } => path.last().cloned(),
                    _ => None,
                };
                let Some(label) = label else {
                    return Err(ParseError::new("base type name", "a non-nominal type", base.span));
                };
                capabilities.push(Capability {
                    span: base.span,
                    label,
                    base,
                });
            }
        }

        let fields = self.parse_fields()?;
        Ok(StructDecl {
            span: kw.span.to(self.prev_span()),
            decorators,
            name,
            params,
            capabilities,
            fields,
        })
    }

    fn parse_union(&mut self, decorators: Vec<Decorator>) -> Result<UnionDecl, ParseError> {
        let kw = self.expect(TokenKind::KwUnion)?;
        let name = self.expect_ident()?;
        let params = self.parse_template_params()?;
        let fields = self.parse_fields()?;
        Ok(UnionDecl {
            span: kw.span.to(self.prev_span()),
            decorators,
            name,
            params,
            fields,
        })
    }

    /// `{ name: type; ... }`
    fn parse_fields(&mut self) -> Result<Vec<Field>, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut fields = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let name = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            let semi = self.expect(TokenKind::Semi)?;
            fields.push(Field {
                span: name.span.to(semi.span),
                name,
                ty,
            });
        }
        self.expect(TokenKind::RBrace)?;
        Ok(fields)
    }

    fn parse_enum(&mut self, decorators: Vec<Decorator>) -> Result<EnumDecl, ParseError> {
        let kw = self.expect(TokenKind::KwEnum)?;
        let name = self.expect_ident()?;
        let backing = if self.eat(TokenKind::Colon).is_some() {
            Some(self.parse_type()?)
        } else {
            None
        };

        self.expect(TokenKind::LBrace)?;
        let mut members = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            let member = self.expect_ident()?;
            let value = if self.eat(TokenKind::Eq).is_some() {
                Some(self.parse_expr()?)
            } else {
                None
            };
            members.push(EnumMember {
                span: member.span.to(self.prev_span()),
                name: member,
                value,
            });
            if self.eat(TokenKind::Semi).is_none() && self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(EnumDecl {
            span: kw.span.to(self.prev_span()),
            decorators,
            name,
            backing,
            members,
        })
    }

    fn parse_function(&mut self, decorators: Vec<Decorator>) -> Result<FunctionDecl, ParseError> {
        let kw = self.expect(TokenKind::KwDef)?;
        let name = self.expect_ident()?;
        let params = self.parse_template_params()?;

        let mut args = Vec::new();
        if self.eat(TokenKind::LParen).is_some() {
            if !self.at(TokenKind::RParen) {
                loop {
                    let arg_name = self.expect_ident()?;
                    self.expect(TokenKind::Colon)?;
                    let ty = self.parse_type()?;
                    let default = if self.eat(TokenKind::Eq).is_some() {
                        Some(self.parse_expr()?)
                    } else {
                        None
                    };
                    args.push(Arg {
                        span: arg_name.span.to(self.prev_span()),
                        name: arg_name,
                        ty,
                        default,
                    });
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
            }
            self.expect(TokenKind::RParen)?;
        }

        let result = if self.eat(TokenKind::Colon).is_some() {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = match self.peek() {
            TokenKind::LBrace => Some(FunctionBody::Block(self.parse_block()?)),
            TokenKind::Eq => {
                self.next();
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semi)?;
                Some(FunctionBody::Expr(expr))
            }
            TokenKind::Semi => {
                self.next();
                None
            }
            _ => return Err(self.error_here("function body, `=` or `;`")),
        };

        Ok(FunctionDecl {
            span: kw.span.to(self.prev_span()),
            decorators,
            name,
            params,
            args,
            result,
            body,
        })
    }

    /// `!<T, U>` after a declaration name; empty when absent.
    fn parse_template_params(&mut self) -> Result<Vec<Ident>, ParseError> {
        let mut params = Vec::new();
        if self.eat(TokenKind::TemplateOpen).is_none() {
            return Ok(params);
        }
        loop {
            params.push(self.expect_ident()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect_close_angle()?;
        Ok(params)
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let lb = self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while !self.at(TokenKind::RBrace) && !self.at(TokenKind::Eof) {
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.recover_to_boundary();
                }
            }
        }
        let rb = self.expect(TokenKind::RBrace)?;
        Ok(Block {
            span: lb.span.to(rb.span),
            stmts,
        })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            TokenKind::KwLet | TokenKind::KwVar => {
                let var = self.parse_var_decl()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Var(var))
            }
            TokenKind::LBrace => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::KwIf => self.parse_branch(),
            TokenKind::KwFor => self.parse_for(),
            TokenKind::KwWhile => {
                let kw = self.next();
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::While(WhileStmt {
                    span: kw.span.to(body.span),
                    cond,
                    body,
                }))
            }
            TokenKind::KwSwitch => self.parse_switch(),
            TokenKind::KwReturn => {
                let kw = self.next();
                let value = if self.at(TokenKind::Semi) {
                    None
                } else {
                    Some(self.parse_expr()?)
                };
                let semi = self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return(ReturnStmt {
                    span: kw.span.to(semi.span),
                    value,
                }))
            }
            TokenKind::KwBreak => {
                let kw = self.next();
                let semi = self.expect(TokenKind::Semi)?;
                Ok(Stmt::Break(kw.span.to(semi.span)))
            }
            TokenKind::KwContinue => {
                let kw = self.next();
                let semi = self.expect(TokenKind::Semi)?;
                Ok(Stmt::Continue(kw.span.to(semi.span)))
            }
            _ => {
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    /// `let`/`var` bindings without the trailing `;`.
    fn parse_var_decl(&mut self) -> Result<VarDecl, ParseError> {
        let kw = self.next();
        let mutable = matches!(kw.kind, TokenKind::KwVar);
        let mut names = Vec::new();
        loop {
            let name = self.expect_ident()?;
            let ty = if self.eat(TokenKind::Colon).is_some() {
                Some(self.parse_type()?)
            } else {
                None
            };
            names.push(VarBinding {
                span: name.span.to(self.prev_span()),
                name,
                ty,
            });
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        let init = if self.eat(TokenKind::Eq).is_some() {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(VarDecl {
            span: kw.span.to(self.prev_span()),
            mutable,
            names,
            init,
        })
    }

    fn parse_branch(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwIf)?;
        let mut paths = Vec::new();
        let mut else_body = None;

        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        paths.push(CondPath { cond, body });

        while self.eat(TokenKind::KwElse).is_some() {
            if self.eat(TokenKind::KwIf).is_some() {
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                paths.push(CondPath { cond, body });
            } else {
                else_body = Some(self.parse_block()?);
                break;
            }
        }

        Ok(Stmt::Branch(Branch {
            span: kw.span.to(self.prev_span()),
            paths,
            else_body,
        }))
    }

    /// `for (init; cond; step) {..}` or `for a, b .. iterable {..}`
    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwFor)?;

        if self.eat(TokenKind::LParen).is_some() {
            let init = match self.peek() {
                TokenKind::Semi => None,
                TokenKind::KwLet | TokenKind::KwVar => Some(Box::new(Stmt::Var(self.parse_var_decl()?))),
                _ => Some(Box::new(Stmt::Expr(self.parse_expr()?))),
            };
            self.expect(TokenKind::Semi)?;
            let cond = if self.at(TokenKind::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(TokenKind::Semi)?;
            let step = if self.at(TokenKind::RParen) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            self.expect(TokenKind::RParen)?;
            let body = self.parse_block()?;
            return Ok(Stmt::ForC(ForCStyle {
                span: kw.span.to(body.span),
                init,
                cond,
                step,
                body,
            }));
        }

        let mut names = Vec::new();
        loop {
            names.push(self.expect_ident()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::DotDot)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::ForRange(ForRange {
            span: kw.span.to(body.span),
            names,
            iterable,
            body,
        }))
    }

    /// `switch e { case v: stmts... else: stmts... }`
    fn parse_switch(&mut self) -> Result<Stmt, ParseError> {
        let kw = self.expect(TokenKind::KwSwitch)?;
        let scrutinee = self.parse_expr()?;
        self.expect(TokenKind::LBrace)?;

        let mut cases = Vec::new();
        let mut default = None;
        loop {
            match self.peek() {
                TokenKind::KwCase => {
                    let case_kw = self.next();
                    let value = self.parse_expr()?;
                    let colon = self.expect(TokenKind::Colon)?;
                    let body = self.parse_case_body(colon.span)?;
                    cases.push(SwitchCase {
                        span: case_kw.span.to(body.span),
                        value,
                        body,
                    });
                }
                TokenKind::KwElse => {
                    self.next();
                    let colon = self.expect(TokenKind::Colon)?;
                    default = Some(self.parse_case_body(colon.span)?);
                }
                TokenKind::RBrace => break,
                _ => return Err(self.error_here("`case`, `else` or `}`")),
            }
        }
        let rb = self.expect(TokenKind::RBrace)?;
        Ok(Stmt::Switch(SwitchStmt {
            span: kw.span.to(rb.span),
            scrutinee,
            cases,
            default,
        }))
    }

    fn parse_case_body(&mut self, start: Span) -> Result<Block, ParseError> {
        let mut stmts = Vec::new();
        while !matches!(
            self.peek(),
            TokenKind::KwCase | TokenKind::KwElse | TokenKind::RBrace | TokenKind::Eof
        ) {
            match self.parse_stmt() {
                Ok(stmt) => stmts.push(stmt),
                Err(err) => {
                    self.errors.push(err);
                    self.recover_to_boundary();
                }
            }
        }
        Ok(Block {
            span: start.to(self.prev_span()),
            stmts,
        })
    }

    // -----------------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------------

    pub fn parse_type(&mut self) -> Result<TypeExpr, ParseError> {
        let start = self.peek_span();
        let mut ty = match self.peek() {
            TokenKind::KwConst => {
                self.next();
                let inner = self.parse_type()?;
                TypeExpr {
                    span: start.to(inner.span),
                    kind: TypeKind::Const(Box::new(inner)),
                }
            }
            TokenKind::Star => {
                self.next();
                let inner = self.parse_type()?;
                TypeExpr {
                    span: start.to(inner.span),
                    kind: TypeKind::Pointer(Box::new(inner)),
                }
            }
            TokenKind::LBracket => {
                self.next();
                let elem = self.parse_type()?;
                let bound = if self.eat(TokenKind::Colon).is_some() {
                    Some(Box::new(self.parse_expr()?))
                } else {
                    None
                };
                let rb = self.expect(TokenKind::RBracket)?;
                TypeExpr {
                    span: start.to(rb.span),
                    kind: TypeKind::Array {
                        elem: Box::new(elem),
                        bound,
                    },
                }
            }
            TokenKind::Ident(_) => {
                let path = self.parse_path()?;
                if self.eat(TokenKind::TemplateOpen).is_some() {
                    let args = self.parse_type_args()?;
                    TypeExpr {
                        span: start.to(self.prev_span()),
                        kind: TypeKind::Template { base: path, args },
                    }
                } else {
                    let span = start.to(self.prev_span());
                    let builtin = match path.as_slice() {
                        [single] => BuiltinType::from_name(&single.node),
                        _ => None,
                    };
                    match builtin {
                        Some(b) => TypeExpr::builtin(span, b),
                        None => TypeExpr {
                            span,
                            kind: TypeKind::Named(path),
                        },
                    }
                }
            }
            _ => return Err(self.error_here("type")),
        };

        // `R(A, B)`: a closure signature in type position.
        while self.eat(TokenKind::LParen).is_some() {
            let mut args = Vec::new();
            if !self.at(TokenKind::RParen) {
                loop {
                    args.push(self.parse_type()?);
                    if self.eat(TokenKind::Comma).is_none() {
                        break;
                    }
                }
            }
            let rp = self.expect(TokenKind::RParen)?;
            ty = TypeExpr {
                span: ty.span.to(rp.span),
                kind: TypeKind::Closure {
                    args,
                    result: Box::new(ty),
                },
            };
        }
        Ok(ty)
    }

    /// Type arguments after `!<` (or `<` in `cast!`), through the closing `>`.
    fn parse_type_args(&mut self) -> Result<Vec<TypeExpr>, ParseError> {
        let mut args = Vec::new();
        loop {
            args.push(self.parse_type()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect_close_angle()?;
        Ok(args)
    }

    /// Accepts `>`, splitting a `>>` so nested argument lists close cleanly.
    fn expect_close_angle(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Gt => {
                self.next();
                Ok(())
            }
            TokenKind::Shr => {
                let tok = &mut self.tokens[self.idx];
                tok.kind = TokenKind::Gt;
                tok.span.start.offset += 1;
                tok.span.start.column += 1;
                Ok(())
            }
            _ => Err(self.error_here("`>`")),
        }
    }

    fn parse_path(&mut self) -> Result<Vec<Ident>, ParseError> {
        let mut path = vec![self.expect_ident()?];
        while self.eat(TokenKind::ColonColon).is_some() {
            path.push(self.expect_ident()?);
        }
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_assign_expr()
    }

    fn parse_assign_expr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_ternary_expr()?;
        let Some(op) = assign_op(self.peek()) else {
            return Ok(lhs);
        };
        self.next();
        let rhs = self.parse_assign_expr()?;
        Ok(binary(op, lhs, rhs))
    }

    fn parse_ternary_expr(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_binary_expr(0)?;
        if self.eat(TokenKind::Question).is_some() {
            let then = self.parse_expr()?;
            self.expect(TokenKind::Colon)?;
            let otherwise = self.parse_ternary_expr()?;
            return Ok(Expr {
                span: cond.span.to(otherwise.span),
                kind: ExprKind::Ternary {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                },
            });
        }
        if self.eat(TokenKind::Elvis).is_some() {
            let rhs = self.parse_ternary_expr()?;
            return Ok(Expr {
                span: cond.span.to(rhs.span),
                kind: ExprKind::Elvis {
                    lhs: Box::new(cond),
                    rhs: Box::new(rhs),
                },
            });
        }
        Ok(cond)
    }

    fn parse_binary_expr(&mut self, level: u8) -> Result<Expr, ParseError> {
        if level >= UNARY_LEVEL {
            return self.parse_unary_expr();
        }
        let mut lhs = self.parse_binary_expr(level + 1)?;
        while let Some(op) = binary_op(level, self.peek()) {
            self.next();
            let rhs = self.parse_binary_expr(level + 1)?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Plus => Some(UnaryOp::Plus),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Star => Some(UnaryOp::Deref),
            TokenKind::Amp => Some(UnaryOp::AddrOf),
            TokenKind::KwUnwrap => {
                let kw = self.next();
                let operand = self.parse_unary_expr()?;
                return Ok(Expr {
                    span: kw.span.to(operand.span),
                    kind: ExprKind::Unwrap(Box::new(operand)),
                });
            }
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_postfix_expr();
        };
        let t = self.next();
        let operand = self.parse_unary_expr()?;
        Ok(Expr {
            span: t.span.to(operand.span),
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        })
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    self.next();
                    let args = self.parse_call_args()?;
                    expr = Expr {
                        span: expr.span.to(self.prev_span()),
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                    };
                }
                TokenKind::LBracket => {
                    self.next();
                    let index = self.parse_expr()?;
                    let rb = self.expect(TokenKind::RBracket)?;
                    expr = Expr {
                        span: expr.span.to(rb.span),
                        kind: ExprKind::Subscript {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                    };
                }
                TokenKind::Dot => {
                    self.next();
                    let name = self.expect_ident()?;
                    expr = Expr {
                        span: expr.span.to(name.span),
                        kind: ExprKind::Member {
                            base: Box::new(expr),
                            name,
                        },
                    };
                }
                TokenKind::Arrow => {
                    self.next();
                    let name = self.expect_ident()?;
                    expr = Expr {
                        span: expr.span.to(name.span),
                        kind: ExprKind::DerefMember {
                            base: Box::new(expr),
                            name,
                        },
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    /// Arguments after an already consumed `(`, through the `)`.
    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(TokenKind::RParen).is_some() {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(args)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseError> {
        let span = self.peek_span();
        let kind = match self.peek().clone() {
            TokenKind::Ident(_) => {
                let path = self.parse_path()?;
                if self.eat(TokenKind::TemplateOpen).is_some() {
                    let args = self.parse_type_args()?;
                    ExprKind::TemplateInst { base: path, args }
                } else {
                    ExprKind::Name(path)
                }
            }
            TokenKind::Int { digits, radix } => {
                self.next();
                ExprKind::IntLit { digits, radix }
            }
            TokenKind::Float(text) => {
                self.next();
                ExprKind::FloatLit(text)
            }
            TokenKind::String(s) => {
                self.next();
                ExprKind::StringLit(s)
            }
            TokenKind::KwTrue => {
                self.next();
                ExprKind::BoolLit(true)
            }
            TokenKind::KwFalse => {
                self.next();
                ExprKind::BoolLit(false)
            }
            TokenKind::KwNull => {
                self.next();
                ExprKind::Null
            }
            TokenKind::LParen => {
                self.next();
                let inner = self.parse_expr()?;
                let rp = self.expect(TokenKind::RParen)?;
                return Ok(Expr {
                    span: span.to(rp.span),
                    kind: inner.kind,
                });
            }
            TokenKind::KwCast => {
                self.next();
                self.expect(TokenKind::Lt)?;
                let mut tys = self.parse_type_args()?;
                if tys.len() != 1 {
                    return Err(ParseError::new(
                        "exactly one cast target type",
                        format!("{} types", tys.len()),
                        span.to(self.prev_span()),
                    ));
                }
                let ty = tys.remove(0);
                self.expect(TokenKind::LParen)?;
                let expr = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                ExprKind::Cast {
                    ty: Box::new(ty),
                    expr: Box::new(expr),
                }
            }
            _ => return Err(self.error_here("expression")),
        };
        Ok(Expr {
            span: span.to(self.prev_span()),
            kind,
        })
    }

    // -----------------------------------------------------------------------
    // Token helpers
    // -----------------------------------------------------------------------

    fn error_here(&self, expected: &str) -> ParseError {
        let tok = self.current();
        ParseError::new(expected, tok.kind.to_string(), tok.span)
    }

    fn expect_ident(&mut self) -> Result<Ident, ParseError> {
        if let TokenKind::Ident(name) = self.peek() {
            let name = name.clone();
            let tok = self.next();
            return Ok(Ident::new(tok.span, name));
        }
        Err(self.error_here("identifier"))
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token, ParseError> {
        if self.at(expected.clone()) {
            return Ok(self.next());
        }
        Err(self.error_here(&expected.to_string()))
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.at(kind) { Some(self.next()) } else { None }
    }

    fn at(&self, kind: TokenKind) -> bool {
        mem::discriminant(self.peek()) == mem::discriminant(&kind)
    }

    fn current(&self) -> &Token {
        let last = self.tokens.len().saturating_sub(1);
        &self.tokens[self.idx.min(last)]
    }

    /// Returns the current token and advances; stays on `Eof`.
    fn next(&mut self) -> Token {
        let tok = self.current().clone();
        if self.idx < self.tokens.len().saturating_sub(1) {
            self.idx += 1;
        }
        tok
    }

    fn peek(&self) -> &TokenKind {
        &self.current().kind
    }

    fn peek_span(&self) -> Span {
        self.current().span
    }

    fn prev_span(&self) -> Span {
        match self.idx.checked_sub(1).and_then(|i| self.tokens.get(i)) {
            Some(tok) => tok.span,
            None => self.peek_span(),
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        span: lhs.span.to(rhs.span),
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}
