#![forbid(unsafe_code)]

use miette::SourceSpan;

/// A point in the source text. `line` and `column` are 1-based; `column`
/// counts characters, not bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Position,
    /// Exclusive byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: Position, end: usize) -> Self {
        debug_assert!(end >= start.offset);
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        let start = if other.start.offset < self.start.offset {
            other.start
        } else {
            self.start
        };
        Span {
            start,
            end: self.end.max(other.end),
        }
    }
}

impl From<Span> for SourceSpan {
    fn from(span: Span) -> Self {
        SourceSpan::new(span.start.offset.into(), span.end - span.start.offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }
}

pub type Ident = Spanned<String>;

/// Joins path segments with `::` for display.
pub fn path_string(segments: &[Ident]) -> String {
    segments
        .iter()
        .map(|s| s.node.as_str())
        .collect::<Vec<_>>()
        .join("::")
}

fn path_span(segments: &[Ident], fallback: Span) -> Span {
    match (segments.first(), segments.last()) {
        (Some(a), Some(b)) => a.span.to(b.span),
        _ => fallback,
    }
}

// ---------------------------------------------------------------------------
// Builtin types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltinType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Void,
    Bool,
    Int,
    UInt,
    Char,
    USize,
    ISize,
}

/// Source spelling of every builtin type. Shared read-only by every stage.
pub static BUILTIN_TYPES: &[(&str, BuiltinType)] = &[
    ("i8", BuiltinType::I8),
    ("i16", BuiltinType::I16),
    ("i32", BuiltinType::I32),
    ("i64", BuiltinType::I64),
    ("u8", BuiltinType::U8),
    ("u16", BuiltinType::U16),
    ("u32", BuiltinType::U32),
    ("u64", BuiltinType::U64),
    ("f32", BuiltinType::F32),
    ("f64", BuiltinType::F64),
    ("void", BuiltinType::Void),
    ("bool", BuiltinType::Bool),
    ("int", BuiltinType::Int),
    ("uint", BuiltinType::UInt),
    ("char", BuiltinType::Char),
    ("usize", BuiltinType::USize),
    ("isize", BuiltinType::ISize),
];

impl BuiltinType {
    pub fn from_name(name: &str) -> Option<Self> {
        BUILTIN_TYPES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, b)| *b)
    }

    pub fn name(self) -> &'static str {
        BUILTIN_TYPES
            .iter()
            .find(|(_, b)| *b == self)
            .map(|(n, _)| *n)
            .unwrap_or("void")
    }

    pub fn is_integer(self) -> bool {
        !matches!(
            self,
            BuiltinType::F32 | BuiltinType::F64 | BuiltinType::Void | BuiltinType::Bool
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, BuiltinType::F32 | BuiltinType::F64)
    }

    /// Inclusive value range for integer builtins, as `(min, max)`.
    ///
    /// `int`/`uint` are taken as 32 bits and `usize`/`isize` as 64 bits.
    pub fn int_range(self) -> Option<(i128, i128)> {
        let r = match self {
            BuiltinType::I8 => (i8::MIN as i128, i8::MAX as i128),
            BuiltinType::I16 => (i16::MIN as i128, i16::MAX as i128),
            BuiltinType::I32 | BuiltinType::Int => (i32::MIN as i128, i32::MAX as i128),
            BuiltinType::I64 | BuiltinType::ISize => (i64::MIN as i128, i64::MAX as i128),
            BuiltinType::U8 => (0, u8::MAX as i128),
            BuiltinType::U16 => (0, u16::MAX as i128),
            BuiltinType::U32 | BuiltinType::UInt => (0, u32::MAX as i128),
            BuiltinType::U64 | BuiltinType::USize => (0, u64::MAX as i128),
            BuiltinType::Char => (i8::MIN as i128, u8::MAX as i128),
            _ => return None,
        };
        Some(r)
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Unit {
    pub decls: Vec<Decl>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Include(Include),
    Alias(AliasDecl),
    Struct(StructDecl),
    Union(UnionDecl),
    Enum(EnumDecl),
    Function(FunctionDecl),
    Global(VarDecl),
}

/// `@name(args)`; the arguments are kept uninterpreted.
#[derive(Clone, Debug, PartialEq)]
pub struct Decorator {
    pub span: Span,
    pub name: Ident,
    pub args: Vec<Expr>,
}

/// `using a::b::c (=> alias)? ((item, ...))? ;`
#[derive(Clone, Debug, PartialEq)]
pub struct Include {
    pub span: Span,
    pub path: Vec<Ident>,
    pub items: Vec<Ident>,
    pub alias: Option<Ident>,
}

impl Include {
    /// Names this include makes visible to the unit.
    pub fn bound_names(&self) -> Vec<&Ident> {
        if !self.items.is_empty() {
            return self.items.iter().collect();
        }
        match &self.alias {
            Some(alias) => vec![alias],
            None => self.path.last().into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AliasDecl {
    pub span: Span,
    pub name: Ident,
    pub target: TypeExpr,
}

/// One inheritance slot: `Label = Base`.
#[derive(Clone, Debug, PartialEq)]
pub struct Capability {
    pub span: Span,
    pub label: Ident,
    pub base: TypeExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeExpr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructDecl {
    pub span: Span,
    pub decorators: Vec<Decorator>,
    pub name: Ident,
    pub params: Vec<Ident>,
    pub capabilities: Vec<Capability>,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UnionDecl {
    pub span: Span,
    pub decorators: Vec<Decorator>,
    pub name: Ident,
    pub params: Vec<Ident>,
    pub fields: Vec<Field>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumMember {
    pub span: Span,
    pub name: Ident,
    pub value: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumDecl {
    pub span: Span,
    pub decorators: Vec<Decorator>,
    pub name: Ident,
    pub backing: Option<TypeExpr>,
    pub members: Vec<EnumMember>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Arg {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeExpr,
    pub default: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FunctionBody {
    Block(Block),
    /// `def f: int = expr;`
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub span: Span,
    pub decorators: Vec<Decorator>,
    pub name: Ident,
    pub params: Vec<Ident>,
    pub args: Vec<Arg>,
    pub result: Option<TypeExpr>,
    /// `None` for a prototype (`def f(x: int): int;`).
    pub body: Option<FunctionBody>,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct VarBinding {
    pub span: Span,
    pub name: Ident,
    pub ty: Option<TypeExpr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub span: Span,
    /// `var` rather than `let`.
    pub mutable: bool,
    pub names: Vec<VarBinding>,
    pub init: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Var(VarDecl),
    Expr(Expr),
    Block(Block),
    Branch(Branch),
    ForRange(ForRange),
    ForC(ForCStyle),
    While(WhileStmt),
    Switch(SwitchStmt),
    Return(ReturnStmt),
    Break(Span),
    Continue(Span),
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Var(s) => s.span,
            Stmt::Expr(e) => e.span,
            Stmt::Block(b) => b.span,
            Stmt::Branch(b) => b.span,
            Stmt::ForRange(f) => f.span,
            Stmt::ForC(f) => f.span,
            Stmt::While(w) => w.span,
            Stmt::Switch(s) => s.span,
            Stmt::Return(r) => r.span,
            Stmt::Break(span) | Stmt::Continue(span) => *span,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CondPath {
    pub cond: Expr,
    pub body: Block,
}

/// `if a {..} else if b {..} else {..}`
#[derive(Clone, Debug, PartialEq)]
pub struct Branch {
    pub span: Span,
    pub paths: Vec<CondPath>,
    pub else_body: Option<Block>,
}

/// `for i, x .. items {..}`
#[derive(Clone, Debug, PartialEq)]
pub struct ForRange {
    pub span: Span,
    pub names: Vec<Ident>,
    pub iterable: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForCStyle {
    pub span: Span,
    pub init: Option<Box<Stmt>>,
    pub cond: Option<Expr>,
    pub step: Option<Expr>,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStmt {
    pub span: Span,
    pub cond: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub span: Span,
    pub value: Expr,
    pub body: Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchStmt {
    pub span: Span,
    pub scrutinee: Expr,
    pub cases: Vec<SwitchCase>,
    pub default: Option<Block>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReturnStmt {
    pub span: Span,
    pub value: Option<Expr>,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    /// A possibly qualified name: `x`, `Color::Red`, `io::print`.
    Name(Vec<Ident>),
    /// Digits without prefix or separators; never narrowed at parse time.
    IntLit { digits: String, radix: u32 },
    FloatLit(String),
    StringLit(String),
    BoolLit(bool),
    Null,
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `lhs ?: rhs`
    Elvis {
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Subscript {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    /// `base.name`
    Member {
        base: Box<Expr>,
        name: Ident,
    },
    /// `base->name`
    DerefMember {
        base: Box<Expr>,
        name: Ident,
    },
    /// `cast!<T>(expr)`
    Cast {
        ty: Box<TypeExpr>,
        expr: Box<Expr>,
    },
    /// `unwrap! expr`
    Unwrap(Box<Expr>),
    /// `name!<T, ...>` in expression position.
    TemplateInst {
        base: Vec<Ident>,
        args: Vec<TypeExpr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
    BitNot,
    Deref,
    AddrOf,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "!",
            UnaryOp::BitNot => "~",
            UnaryOp::Deref => "*",
            UnaryOp::AddrOf => "&",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,

    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    RemAssign,
    AndAssign,
    OrAssign,
    XorAssign,
    ShlAssign,
    ShrAssign,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::BitAnd => "&",
            BinOp::BitXor => "^",
            BinOp::BitOr => "|",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Assign => "=",
            BinOp::AddAssign => "+=",
            BinOp::SubAssign => "-=",
            BinOp::MulAssign => "*=",
            BinOp::DivAssign => "/=",
            BinOp::RemAssign => "%=",
            BinOp::AndAssign => "&=",
            BinOp::OrAssign => "|=",
            BinOp::XorAssign => "^=",
            BinOp::ShlAssign => "<<=",
            BinOp::ShrAssign => ">>=",
        }
    }

    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            BinOp::Assign
                | BinOp::AddAssign
                | BinOp::SubAssign
                | BinOp::MulAssign
                | BinOp::DivAssign
                | BinOp::RemAssign
                | BinOp::AndAssign
                | BinOp::OrAssign
                | BinOp::XorAssign
                | BinOp::ShlAssign
                | BinOp::ShrAssign
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge | BinOp::Eq | BinOp::Ne
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct TypeExpr {
    pub span: Span,
    pub kind: TypeKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeKind {
    Builtin(BuiltinType),
    Pointer(Box<TypeExpr>),
    /// `[T]` or `[T : bound]`
    Array {
        elem: Box<TypeExpr>,
        bound: Option<Box<Expr>>,
    },
    /// `R(A, B)`
    Closure {
        args: Vec<TypeExpr>,
        result: Box<TypeExpr>,
    },
    Named(Vec<Ident>),
    Const(Box<TypeExpr>),
    /// `Name!<A, B>`
    Template {
        base: Vec<Ident>,
        args: Vec<TypeExpr>,
    },
}

impl TypeExpr {
    pub fn builtin(span: Span, b: BuiltinType) -> Self {
        Self {
            span,
            kind: TypeKind::Builtin(b),
        }
    }

    /// Span of the leading path for named and template types.
    pub fn path_span(&self) -> Span {
        match &self.kind {
            TypeKind::Named(p) | TypeKind::Template { base: p, .. } => path_span(p, self.span),
            _ => self.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: usize) -> Position {
        Position {
            offset,
            line: 1,
            column: offset as u32 + 1,
        }
    }

    #[test]
    fn span_join_covers_both() {
        let a = Span::new(pos(4), 6);
        let b = Span::new(pos(1), 2);
        let j = a.to(b);
        assert_eq!(j.start.offset, 1);
        assert_eq!(j.end, 6);
        let ss: SourceSpan = j.into();
        assert_eq!(ss.offset(), 1);
        assert_eq!(ss.len(), 5);
    }

    #[test]
    fn builtin_table_round_trips_names() {
        for (name, b) in BUILTIN_TYPES {
            assert_eq!(BuiltinType::from_name(name), Some(*b));
            assert_eq!(b.name(), *name);
        }
        assert_eq!(BuiltinType::from_name("Vec"), None);
    }

    #[test]
    fn include_binds_items_alias_or_last_segment() {
        let id = |s: &str| Ident::new(Span::default(), s.to_string());
        let mut inc = Include {
            span: Span::default(),
            path: vec![id("a"), id("b")],
            items: vec![],
            alias: None,
        };
        assert_eq!(inc.bound_names()[0].node, "b");
        inc.alias = Some(id("z"));
        assert_eq!(inc.bound_names()[0].node, "z");
        inc.items = vec![id("x"), id("y")];
        let names: Vec<_> = inc.bound_names().iter().map(|i| i.node.clone()).collect();
        assert_eq!(names, vec!["x", "y"]);
    }
}
