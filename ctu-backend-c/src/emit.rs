#![forbid(unsafe_code)]

use ctu_ir::{
    BuiltinType, IrAggregate, IrAlias, IrExpr, IrFunction, IrInt, IrModule, IrStmt, IrType, Linkage, aggregate_order,
};
use tracing::{debug, warn};

use crate::EmitOptions;

const INDENT: &str = "    ";

/// Renders a lowered module as one C translation unit.
///
/// Emission is total: every IR module produces text, and the same module
/// always produces the same text.
pub fn emit(module: &IrModule, options: &EmitOptions) -> String {
    let mut w = Writer::default();

    if options.banner {
        w.line(&format!(
            "/* Generated by ctu from unit `{}`. Do not edit. */",
            module.unit.replace("*/", "* /")
        ));
    }
    w.line("#include <stddef.h>");
    w.line("#include <stdint.h>");
    for inc in &module.includes {
        w.line(&format!("#include \"{}.h\"", c_escape_string_literal(&inc.path.join("/"))));
    }
    w.blank();

    if !module.aggregates.is_empty() {
        for agg in &module.aggregates {
            w.line(&format!("typedef {kw} {n} {n};", kw = agg.kind.keyword(), n = agg.name));
        }
        w.blank();
    }

    for e in &module.enums {
        w.line(&format!("enum {} {{", e.name));
        w.indent += 1;
        let count = e.members.len();
        for (i, (name, value)) in e.members.iter().enumerate() {
            let sep = if i + 1 < count { "," } else { "" };
            match value {
                Some(v) => w.line(&format!("{name} = {}{sep}", expr(v))),
                None => w.line(&format!("{name}{sep}")),
            }
        }
        w.indent -= 1;
        w.line("};");
        match &e.backing {
            Some(ty) => w.line(&format!("typedef {};", declare(ty, &e.name))),
            None => w.line(&format!("typedef enum {n} {n};", n = e.name)),
        }
        w.blank();
    }

    if !module.closures.is_empty() {
        for c in &module.closures {
            let args = param_types(&c.args);
            w.line(&format!("typedef {};", declare(&c.result, &format!("(*{})({args})", c.name))));
        }
        w.blank();
    }

    // An alias that embeds an aggregate by value needs its complete definition.
    let (late_aliases, early_aliases): (Vec<_>, Vec<_>) = module.aliases.iter().partition(|a| {
        a.ty.embedded_name()
            .is_some_and(|n| module.aggregates.iter().any(|agg| agg.name == n))
    });
    emit_aliases(&mut w, &early_aliases);

    let order = match aggregate_order(&module.aggregates) {
        Ok(order) => order,
        Err(cycle) => {
            warn!(cycle = ?cycle.path, "aggregate cycle reached the emitter; keeping source order");
            (0..module.aggregates.len()).collect()
        }
    };
    for agg in order.iter().filter_map(|&i| module.aggregates.get(i)) {
        if !agg.opaque {
            emit_aggregate(&mut w, agg);
        }
    }
    emit_aliases(&mut w, &late_aliases);

    if !module.globals.is_empty() {
        for g in &module.globals {
            match &g.init {
                Some(init) => w.line(&format!("{} = {};", declare(&g.ty, &g.name), expr(init))),
                None => w.line(&format!("{};", declare(&g.ty, &g.name))),
            }
        }
        w.blank();
    }

    if !module.functions.is_empty() {
        for f in &module.functions {
            w.line(&format!("{};", signature(f)));
        }
        w.blank();
    }

    for f in module.functions.iter().filter(|f| f.body.is_some()) {
        emit_function(&mut w, module, f, options);
    }

    debug!(unit = %module.unit, bytes = w.out.len(), "emitted C");
    w.out
}

#[derive(Default)]
struct Writer {
    out: String,
    indent: usize,
}

impl Writer {
    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn raw(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank(&mut self) {
        self.out.push('\n');
    }
}

fn emit_aliases(w: &mut Writer, aliases: &[&IrAlias]) {
    if aliases.is_empty() {
        return;
    }
    for a in aliases {
        w.line(&format!("typedef {};", declare(&a.ty, &a.name)));
    }
    w.blank();
}

fn emit_aggregate(w: &mut Writer, agg: &IrAggregate) {
    w.line(&format!("{} {} {{", agg.kind.keyword(), agg.name));
    w.indent += 1;
    if agg.fields.is_empty() {
        // C has no empty aggregates.
        w.line("char ctu_empty_;");
    }
    for f in &agg.fields {
        w.line(&format!("{};", declare(&f.ty, &f.name)));
    }
    w.indent -= 1;
    w.line("};");
    w.blank();
}

fn signature(f: &IrFunction) -> String {
    let prefix = match f.linkage {
        Linkage::External => "",
        Linkage::Internal => "static ",
        Linkage::Inline => "static inline ",
    };
    let params = if f.args.is_empty() {
        "void".to_string()
    } else {
        f.args
            .iter()
            .map(|a| declare(&a.ty, &a.name))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("{prefix}{}", declare(&f.result, &format!("{}({params})", f.name)))
}

fn emit_function(w: &mut Writer, module: &IrModule, f: &IrFunction, options: &EmitOptions) {
    let Some(body) = &f.body else { return };
    if options.line_directives {
        emit_line_directive(w, &module.unit, f.position.line);
    }
    w.line(&format!("{} {{", signature(f)));
    w.indent += 1;
    for stmt in body {
        emit_stmt(w, stmt);
    }
    w.indent -= 1;
    w.line("}");
    w.blank();
}

fn emit_line_directive(w: &mut Writer, unit: &str, line: u32) {
    w.raw(&format!("#line {line} \"{}\"", c_escape_string_literal(unit)));
}

fn emit_block(w: &mut Writer, body: &[IrStmt]) {
    w.indent += 1;
    for stmt in body {
        emit_stmt(w, stmt);
    }
    w.indent -= 1;
}

fn emit_stmt(w: &mut Writer, stmt: &IrStmt) {
    match stmt {
        IrStmt::Decl { .. } | IrStmt::Expr(_) => {
            if let Some(text) = simple_stmt(stmt) {
                w.line(&format!("{text};"));
            }
        }
        IrStmt::Block(body) => {
            w.line("{");
            emit_block(w, body);
            w.line("}");
        }
        IrStmt::If { cond, then, otherwise } => {
            w.line(&format!("if ({}) {{", expr(cond)));
            emit_block(w, then);
            let mut rest = otherwise.as_deref();
            loop {
                match rest {
                    None => {
                        w.line("}");
                        break;
                    }
                    Some([IrStmt::If { cond, then, otherwise }]) => {
                        w.line(&format!("}} else if ({}) {{", expr(cond)));
                        emit_block(w, then);
                        rest = otherwise.as_deref();
                    }
                    Some(body) => {
                        w.line("} else {");
                        emit_block(w, body);
                        w.line("}");
                        break;
                    }
                }
            }
        }
        IrStmt::While { cond, body } => {
            w.line(&format!("while ({}) {{", expr(cond)));
            emit_block(w, body);
            w.line("}");
        }
        IrStmt::For { init, cond, step, body } => {
            let init_text = match init.as_deref() {
                Some(s) => match simple_stmt(s) {
                    Some(text) => text,
                    None => {
                        emit_stmt(w, s);
                        String::new()
                    }
                },
                None => String::new(),
            };
            let cond_text = cond.as_ref().map(expr).unwrap_or_default();
            let step_text = step.as_ref().map(expr).unwrap_or_default();
            w.line(&format!("for ({init_text}; {cond_text}; {step_text}) {{"));
            emit_block(w, body);
            w.line("}");
        }
        IrStmt::Switch {
            scrutinee,
            cases,
            default,
        } => {
            w.line(&format!("switch ({}) {{", expr(scrutinee)));
            for (value, body) in cases {
                w.line(&format!("case {}: {{", expr(value)));
                emit_block(w, body);
                w.indent += 1;
                w.line("break;");
                w.indent -= 1;
                w.line("}");
            }
            if let Some(body) = default {
                w.line("default: {");
                emit_block(w, body);
                w.indent += 1;
                w.line("break;");
                w.indent -= 1;
                w.line("}");
            }
            w.line("}");
        }
        IrStmt::Return(None) => w.line("return;"),
        IrStmt::Return(Some(value)) => w.line(&format!("return {};", expr(value))),
        IrStmt::Break => w.line("break;"),
        IrStmt::Continue => w.line("continue;"),
    }
}

/// Declarations and expression statements without the trailing `;`, as
/// they appear in a `for` header.
fn simple_stmt(stmt: &IrStmt) -> Option<String> {
    match stmt {
        IrStmt::Decl { name, ty, init: Some(init) } => Some(format!("{} = {}", declare(ty, name), expr(init))),
        IrStmt::Decl { name, ty, init: None } => Some(declare(ty, name)),
        IrStmt::Expr(e) => Some(expr(e)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

fn c_builtin(b: BuiltinType) -> &'static str {
    match b {
        BuiltinType::I8 => "int8_t",
        BuiltinType::I16 => "int16_t",
        BuiltinType::I32 => "int32_t",
        BuiltinType::I64 => "int64_t",
        BuiltinType::U8 => "uint8_t",
        BuiltinType::U16 => "uint16_t",
        BuiltinType::U32 => "uint32_t",
        BuiltinType::U64 => "uint64_t",
        BuiltinType::F32 => "float",
        BuiltinType::F64 => "double",
        BuiltinType::Void => "void",
        BuiltinType::Bool => "_Bool",
        BuiltinType::Int => "int",
        BuiltinType::UInt => "unsigned int",
        BuiltinType::Char => "char",
        BuiltinType::USize => "size_t",
        BuiltinType::ISize => "ptrdiff_t",
    }
}

/// C declarator for `ty` applied to `inner` (a name, or empty for an
/// abstract declarator in casts). Unbounded arrays decay to pointers.
fn declare(ty: &IrType, inner: &str) -> String {
    match ty {
        IrType::Builtin(b) => with_base(c_builtin(*b), inner),
        IrType::Named(n) => with_base(n, inner),
        IrType::Const(t) => match t.as_ref() {
            IrType::Pointer(target) | IrType::Array { elem: target, bound: None } => {
                let qualified = if inner.is_empty() {
                    "const".to_string()
                } else {
                    format!("const {inner}")
                };
                declare(target, &pointer_to(target, &qualified))
            }
            other => format!("const {}", declare(other, inner)),
        },
        IrType::Pointer(target) | IrType::Array { elem: target, bound: None } => {
            declare(target, &pointer_to(target, inner))
        }
        IrType::Array { elem, bound: Some(n) } => declare(elem, &format!("{inner}[{n}]")),
    }
}

fn pointer_to(target: &IrType, inner: &str) -> String {
    if matches!(target, IrType::Array { bound: Some(_), .. }) {
        format!("(*{inner})")
    } else {
        format!("*{inner}")
    }
}

fn with_base(base: &str, inner: &str) -> String {
    if inner.is_empty() {
        base.to_string()
    } else {
        format!("{base} {inner}")
    }
}

fn param_types(args: &[IrType]) -> String {
    if args.is_empty() {
        return "void".to_string();
    }
    args.iter().map(|a| declare(a, "")).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn expr(e: &IrExpr) -> String {
    match e {
        IrExpr::Int(v) => int_literal(*v),
        IrExpr::Float(text) => text.clone(),
        IrExpr::Str(s) => format!("\"{}\"", c_escape_string_literal(s)),
        IrExpr::Bool(b) => u8::from(*b).to_string(),
        IrExpr::Null => "NULL".to_string(),
        IrExpr::Name(n) => n.clone(),
        IrExpr::Unary { op, operand } => format!("{}{}", op.symbol(), unary_operand(operand)),
        IrExpr::Binary { op, lhs, rhs } => {
            format!("{} {} {}", binary_operand(lhs), op.symbol(), binary_operand(rhs))
        }
        IrExpr::Ternary { cond, then, otherwise } => format!(
            "{} ? {} : {}",
            binary_operand(cond),
            binary_operand(then),
            binary_operand(otherwise)
        ),
        IrExpr::Call { callee, args } => {
            let args = args.iter().map(expr).collect::<Vec<_>>().join(", ");
            format!("{}({args})", postfix_base(callee))
        }
        IrExpr::Index { base, index } => format!("{}[{}]", postfix_base(base), expr(index)),
        IrExpr::Member { base, field } => format!("{}.{field}", postfix_base(base)),
        IrExpr::Arrow { base, field } => format!("{}->{field}", postfix_base(base)),
        IrExpr::Cast { ty, expr: inner } => format!("(({}){})", declare(ty, ""), unary_operand(inner)),
        IrExpr::ZeroInit(ty) => format!("({}){{0}}", declare(ty, "")),
    }
}

fn parenthesize(e: &IrExpr) -> String {
    format!("({})", expr(e))
}

fn binary_operand(e: &IrExpr) -> String {
    match e {
        IrExpr::Binary { .. } | IrExpr::Ternary { .. } => parenthesize(e),
        _ => expr(e),
    }
}

fn unary_operand(e: &IrExpr) -> String {
    match e {
        IrExpr::Binary { .. } | IrExpr::Ternary { .. } | IrExpr::Unary { .. } => parenthesize(e),
        IrExpr::Int(v) if v.negative => parenthesize(e),
        _ => expr(e),
    }
}

fn postfix_base(e: &IrExpr) -> String {
    match e {
        IrExpr::Binary { .. } | IrExpr::Ternary { .. } | IrExpr::Unary { .. } | IrExpr::ZeroInit(_) => {
            parenthesize(e)
        }
        IrExpr::Int(v) if v.negative => parenthesize(e),
        _ => expr(e),
    }
}

/// Integer constants keep their exact value. Anything outside `int` range is
/// wrapped in the `<stdint.h>` constant macros so its type is wide enough.
fn int_literal(v: IrInt) -> String {
    const I64_MIN_MAGNITUDE: u64 = 1 << 63;
    let sign = if v.negative { "-" } else { "" };
    if v.negative && v.magnitude == I64_MIN_MAGNITUDE {
        "INT64_MIN".to_string()
    } else if v.magnitude <= i32::MAX as u64 {
        format!("{sign}{}", v.magnitude)
    } else if v.negative || v.magnitude <= i64::MAX as u64 {
        format!("INT64_C({sign}{})", v.magnitude)
    } else {
        format!("UINT64_C({})", v.magnitude)
    }
}

fn c_escape_string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            ' '..='~' => out.push(ch),
            _ => {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\{byte:03o}"));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin(b: BuiltinType) -> IrType {
        IrType::Builtin(b)
    }

    #[test]
    fn declarators_nest_like_c() {
        let p = IrType::Pointer(Box::new(IrType::Const(Box::new(builtin(BuiltinType::Char)))));
        assert_eq!(declare(&p, "s"), "const char *s");

        let arr = IrType::Array {
            elem: Box::new(builtin(BuiltinType::U8)),
            bound: Some(16),
        };
        assert_eq!(declare(&arr, "buf"), "uint8_t buf[16]");
        assert_eq!(declare(&IrType::Pointer(Box::new(arr)), "p"), "uint8_t (*p)[16]");

        let const_ptr = IrType::Const(Box::new(IrType::Pointer(Box::new(builtin(BuiltinType::Int)))));
        assert_eq!(declare(&const_ptr, "q"), "int *const q");

        let unbounded = IrType::Array {
            elem: Box::new(builtin(BuiltinType::F32)),
            bound: None,
        };
        assert_eq!(declare(&unbounded, "xs"), "float *xs");
        assert_eq!(declare(&builtin(BuiltinType::Bool), ""), "_Bool");
    }

    #[test]
    fn integers_keep_their_exact_value() {
        let int = |magnitude, negative| int_literal(IrInt { magnitude, negative });
        assert_eq!(int(100, false), "100");
        assert_eq!(int(128, true), "-128");
        assert_eq!(int(2_147_483_648, false), "INT64_C(2147483648)");
        assert_eq!(int(2_147_483_648, true), "INT64_C(-2147483648)");
        assert_eq!(int(1 << 63, true), "INT64_MIN");
        assert_eq!(int(u64::MAX, false), "UINT64_C(18446744073709551615)");
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(c_escape_string_literal("a\"b\\c\n"), "a\\\"b\\\\c\\n");
        assert_eq!(c_escape_string_literal("é"), "\\303\\251");
    }

    #[test]
    fn compound_operands_are_parenthesized_by_kind() {
        use ctu_ir::{BinOp, UnaryOp};
        let sum = IrExpr::binary(BinOp::Add, IrExpr::name("a"), IrExpr::name("b"));
        let product = IrExpr::binary(BinOp::Mul, sum.clone(), IrExpr::name("c"));
        assert_eq!(expr(&product), "(a + b) * c");

        let neg = IrExpr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(IrExpr::Int(IrInt {
                magnitude: 1,
                negative: true,
            })),
        };
        assert_eq!(expr(&neg), "-(-1)");

        let deref_member = IrExpr::member(
            IrExpr::Unary {
                op: UnaryOp::Deref,
                operand: Box::new(IrExpr::name("p")),
            },
            "x",
        );
        assert_eq!(expr(&deref_member), "(*p).x");

        let cast = IrExpr::Cast {
            ty: builtin(BuiltinType::Bool),
            expr: Box::new(IrExpr::int(100)),
        };
        assert_eq!(expr(&cast), "((_Bool)100)");
    }
}
