#![forbid(unsafe_code)]

use ctu_ast::Position;

pub use ctu_ast::{BinOp, BuiltinType, UnaryOp};

/// A fully resolved type: no aliases, templates or closure signatures remain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IrType {
    Builtin(BuiltinType),
    Pointer(Box<IrType>),
    /// Unbounded arrays are passed and stored as pointers.
    Array {
        elem: Box<IrType>,
        bound: Option<u64>,
    },
    /// An aggregate, enum or closure typedef.
    Named(String),
    Const(Box<IrType>),
}

impl IrType {
    pub fn void() -> Self {
        IrType::Builtin(BuiltinType::Void)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, IrType::Builtin(BuiltinType::Void))
    }

    /// Pointer-like for `NULL` comparison and unwrapping.
    pub fn is_pointer(&self) -> bool {
        match self {
            IrType::Pointer(_) | IrType::Array { bound: None, .. } => true,
            IrType::Const(inner) => inner.is_pointer(),
            _ => false,
        }
    }

    pub fn strip_const(&self) -> &IrType {
        match self {
            IrType::Const(inner) => inner.strip_const(),
            other => other,
        }
    }

    /// Identifier-safe spelling used to build template and closure names.
    pub fn mangle(&self) -> String {
        match self {
            IrType::Builtin(b) => b.name().to_string(),
            IrType::Pointer(inner) => format!("ptr_{}", inner.mangle()),
            IrType::Array {
                elem,
                bound: Some(n),
            } => format!("arr{n}_{}", elem.mangle()),
            IrType::Array { elem, bound: None } => format!("arr_{}", elem.mangle()),
            IrType::Named(name) => name.clone(),
            IrType::Const(inner) => format!("const_{}", inner.mangle()),
        }
    }

    /// The aggregate this type embeds by value, if any.
    pub fn embedded_name(&self) -> Option<&str> {
        match self {
            IrType::Named(name) => Some(name),
            IrType::Const(inner) => inner.embedded_name(),
            IrType::Array {
                elem,
                bound: Some(_),
            } => elem.embedded_name(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct IrModule {
    pub unit: String,
    pub includes: Vec<IrInclude>,
    pub enums: Vec<IrEnum>,
    pub closures: Vec<IrClosure>,
    pub aliases: Vec<IrAlias>,
    /// Structs and unions in declaration/instantiation order.
    pub aggregates: Vec<IrAggregate>,
    pub globals: Vec<IrGlobal>,
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn aggregate(&self, name: &str) -> Option<&IrAggregate> {
        self.aggregates.iter().find(|a| a.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrInclude {
    pub path: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrAlias {
    pub name: String,
    pub ty: IrType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrEnum {
    pub name: String,
    pub backing: Option<IrType>,
    /// Member names are already prefixed with the enum name.
    pub members: Vec<(String, Option<IrExpr>)>,
}

/// A function-pointer typedef.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrClosure {
    pub name: String,
    pub args: Vec<IrType>,
    pub result: IrType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggregateKind {
    Struct,
    Union,
}

impl AggregateKind {
    pub fn keyword(self) -> &'static str {
        match self {
            AggregateKind::Struct => "struct",
            AggregateKind::Union => "union",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrField {
    pub name: String,
    pub ty: IrType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrAggregate {
    pub kind: AggregateKind,
    pub name: String,
    /// Capability slots come first, named by their label.
    pub fields: Vec<IrField>,
    pub capabilities: Vec<String>,
    /// Forward-declared only.
    pub opaque: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrGlobal {
    pub name: String,
    pub ty: IrType,
    pub init: Option<IrExpr>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Linkage {
    #[default]
    External,
    /// `static`
    Internal,
    /// `static inline`
    Inline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrFunction {
    pub name: String,
    pub args: Vec<IrField>,
    pub result: IrType,
    /// `None` for prototypes of external functions.
    pub body: Option<Vec<IrStmt>>,
    pub linkage: Linkage,
    pub position: Position,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrStmt {
    Decl {
        name: String,
        ty: IrType,
        init: Option<IrExpr>,
    },
    Expr(IrExpr),
    Block(Vec<IrStmt>),
    If {
        cond: IrExpr,
        then: Vec<IrStmt>,
        otherwise: Option<Vec<IrStmt>>,
    },
    While {
        cond: IrExpr,
        body: Vec<IrStmt>,
    },
    For {
        init: Option<Box<IrStmt>>,
        cond: Option<IrExpr>,
        step: Option<IrExpr>,
        body: Vec<IrStmt>,
    },
    Switch {
        scrutinee: IrExpr,
        cases: Vec<(IrExpr, Vec<IrStmt>)>,
        default: Option<Vec<IrStmt>>,
    },
    Return(Option<IrExpr>),
    Break,
    Continue,
}

/// An integer constant already checked against the type it was narrowed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrInt {
    pub magnitude: u64,
    pub negative: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrExpr {
    Int(IrInt),
    Float(String),
    Str(String),
    Bool(bool),
    Null,
    Name(String),
    Unary {
        op: UnaryOp,
        operand: Box<IrExpr>,
    },
    Binary {
        op: BinOp,
        lhs: Box<IrExpr>,
        rhs: Box<IrExpr>,
    },
    Ternary {
        cond: Box<IrExpr>,
        then: Box<IrExpr>,
        otherwise: Box<IrExpr>,
    },
    Call {
        callee: Box<IrExpr>,
        args: Vec<IrExpr>,
    },
    Index {
        base: Box<IrExpr>,
        index: Box<IrExpr>,
    },
    Member {
        base: Box<IrExpr>,
        field: String,
    },
    Arrow {
        base: Box<IrExpr>,
        field: String,
    },
    Cast {
        ty: IrType,
        expr: Box<IrExpr>,
    },
    /// `(T){0}`
    ZeroInit(IrType),
}

impl IrExpr {
    pub fn name(name: impl Into<String>) -> Self {
        IrExpr::Name(name.into())
    }

    pub fn int(value: u64) -> Self {
        IrExpr::Int(IrInt {
            magnitude: value,
            negative: false,
        })
    }

    pub fn member(base: IrExpr, field: impl Into<String>) -> Self {
        IrExpr::Member {
            base: Box::new(base),
            field: field.into(),
        }
    }

    pub fn binary(op: BinOp, lhs: IrExpr, rhs: IrExpr) -> Self {
        IrExpr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Free of calls and assignments, so it may be evaluated twice.
    pub fn is_pure(&self) -> bool {
        match self {
            IrExpr::Int(_)
            | IrExpr::Float(_)
            | IrExpr::Str(_)
            | IrExpr::Bool(_)
            | IrExpr::Null
            | IrExpr::Name(_)
            | IrExpr::ZeroInit(_) => true,
            IrExpr::Unary { operand, .. } => operand.is_pure(),
            IrExpr::Binary { op, lhs, rhs } => !op.is_assignment() && lhs.is_pure() && rhs.is_pure(),
            IrExpr::Ternary {
                cond,
                then,
                otherwise,
            } => cond.is_pure() && then.is_pure() && otherwise.is_pure(),
            IrExpr::Call { .. } => false,
            IrExpr::Index { base, index } => base.is_pure() && index.is_pure(),
            IrExpr::Member { base, .. } | IrExpr::Arrow { base, .. } => base.is_pure(),
            IrExpr::Cast { expr, .. } => expr.is_pure(),
        }
    }

    /// Calls `f` for every `Name` in the expression, callees included.
    pub fn for_each_name(&self, f: &mut impl FnMut(&str)) {
        match self {
            IrExpr::Name(n) => f(n),
            IrExpr::Int(_) | IrExpr::Float(_) | IrExpr::Str(_) | IrExpr::Bool(_) | IrExpr::Null | IrExpr::ZeroInit(_) => {}
            IrExpr::Unary { operand, .. } => operand.for_each_name(f),
            IrExpr::Binary { lhs, rhs, .. } => {
                lhs.for_each_name(f);
                rhs.for_each_name(f);
            }
            IrExpr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                cond.for_each_name(f);
                then.for_each_name(f);
                otherwise.for_each_name(f);
            }
            IrExpr::Call { callee, args } => {
                callee.for_each_name(f);
                for a in args {
                    a.for_each_name(f);
                }
            }
            IrExpr::Index { base, index } => {
                base.for_each_name(f);
                index.for_each_name(f);
            }
            IrExpr::Member { base, .. } | IrExpr::Arrow { base, .. } => base.for_each_name(f),
            IrExpr::Cast { expr, .. } => expr.for_each_name(f),
        }
    }

    /// Replaces every `Name` for which `f` returns a value.
    pub fn replace_names(self, f: &impl Fn(&str) -> Option<IrExpr>) -> IrExpr {
        let boxed = |e: Box<IrExpr>| Box::new(e.replace_names(f));
        match self {
            IrExpr::Name(n) => f(&n).unwrap_or(IrExpr::Name(n)),
            IrExpr::Unary { op, operand } => IrExpr::Unary {
                op,
                operand: boxed(operand),
            },
            IrExpr::Binary { op, lhs, rhs } => IrExpr::Binary {
                op,
                lhs: boxed(lhs),
                rhs: boxed(rhs),
            },
            IrExpr::Ternary {
                cond,
                then,
                otherwise,
            } => IrExpr::Ternary {
                cond: boxed(cond),
                then: boxed(then),
                otherwise: boxed(otherwise),
            },
            IrExpr::Call { callee, args } => IrExpr::Call {
                callee: boxed(callee),
                args: args.into_iter().map(|a| a.replace_names(f)).collect(),
            },
            IrExpr::Index { base, index } => IrExpr::Index {
                base: boxed(base),
                index: boxed(index),
            },
            IrExpr::Member { base, field } => IrExpr::Member {
                base: boxed(base),
                field,
            },
            IrExpr::Arrow { base, field } => IrExpr::Arrow {
                base: boxed(base),
                field,
            },
            IrExpr::Cast { ty, expr } => IrExpr::Cast { ty, expr: boxed(expr) },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_spells_nested_types() {
        let t = IrType::Pointer(Box::new(IrType::Array {
            elem: Box::new(IrType::Const(Box::new(IrType::Builtin(BuiltinType::U8)))),
            bound: Some(4),
        }));
        assert_eq!(t.mangle(), "ptr_arr4_const_u8");
    }

    #[test]
    fn embedded_name_sees_through_arrays_but_not_pointers() {
        let by_value = IrType::Array {
            elem: Box::new(IrType::Named("Inner".into())),
            bound: Some(2),
        };
        assert_eq!(by_value.embedded_name(), Some("Inner"));
        let by_ptr = IrType::Pointer(Box::new(IrType::Named("Inner".into())));
        assert_eq!(by_ptr.embedded_name(), None);
    }

    #[test]
    fn purity_rejects_calls_and_assignments() {
        let call = IrExpr::Call {
            callee: Box::new(IrExpr::name("f")),
            args: vec![],
        };
        assert!(!call.is_pure());
        let assign = IrExpr::binary(BinOp::Assign, IrExpr::name("a"), IrExpr::int(1));
        assert!(!assign.is_pure());
        assert!(IrExpr::member(IrExpr::name("p"), "x").is_pure());
    }

    #[test]
    fn replace_names_leaves_fields_alone() {
        let e = IrExpr::binary(BinOp::Add, IrExpr::name("a"), IrExpr::member(IrExpr::name("s"), "a"));
        let replaced = e.replace_names(&|n: &str| (n == "a").then(|| IrExpr::int(1)));
        let mut names = Vec::new();
        replaced.for_each_name(&mut |n: &str| names.push(n.to_string()));
        assert_eq!(names, vec!["s"]);
        assert_eq!(
            replaced,
            IrExpr::binary(BinOp::Add, IrExpr::int(1), IrExpr::member(IrExpr::name("s"), "a"))
        );
    }
}
