use ctu_core::{Lowered, LoweringError, LoweringErrorKind, lower, validate};
use ctu_ir::{BinOp, BuiltinType, IrExpr, IrInt, IrStmt, IrType, Linkage, UnaryOp};

fn lower_src(src: &str) -> Result<Lowered, LoweringError> {
    let unit = ctu_parse::parse_source(src).expect("parse");
    let unresolved = validate(&unit);
    assert!(unresolved.is_empty(), "unresolved: {unresolved:?}");
    lower(&unit, "test")
}

fn lowered(src: &str) -> Lowered {
    lower_src(src).expect("lower")
}

fn lower_err(src: &str) -> LoweringErrorKind {
    match lower_src(src) {
        Ok(_) => panic!("expected a lowering error"),
        Err(e) => e.kind,
    }
}

fn body<'a>(l: &'a Lowered, name: &str) -> &'a [IrStmt] {
    l.module
        .function(name)
        .and_then(|f| f.body.as_deref())
        .unwrap_or_else(|| panic!("no body for `{name}`"))
}

#[test]
fn aliases_resolve_through_chains() {
    let l = lowered("using a = *b; using b = int; var g: a;");
    assert_eq!(
        l.module.globals[0].ty,
        IrType::Pointer(Box::new(IrType::Builtin(BuiltinType::Int)))
    );
    assert_eq!(l.module.aliases.len(), 2);
}

#[test]
fn alias_cycle_is_rejected() {
    assert_eq!(lower_err("using a = *b; using b = a;"), LoweringErrorKind::CyclicAlias);
}

#[test]
fn template_instances_are_memoized() {
    let l = lowered(
        r#"
struct Pair!<T, U> { first: T; second: U; }
var a: Pair!<i32, f32>;
var b: Pair!<i32, f32>;
var c: *Pair!<i32, f32>;
var d: Pair!<f32, i32>;
"#,
    );
    let names: Vec<_> = l.module.aggregates.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["Pair_i32_f32", "Pair_f32_i32"]);
    assert_eq!(l.module.globals[1].ty, IrType::Named("Pair_i32_f32".into()));
}

#[test]
fn template_arity_mismatch_is_rejected() {
    let src = "struct Pair!<T, U> { first: T; second: U; } var a: Pair!<i32>;";
    assert_eq!(lower_err(src), LoweringErrorKind::TemplateArity);
    let src = "struct Pair!<T, U> { first: T; second: U; } var a: Pair;";
    assert_eq!(lower_err(src), LoweringErrorKind::TemplateArity);
}

#[test]
fn template_functions_instantiate_once_per_argument_list() {
    let l = lowered(
        r#"
def max!<T>(a: T, b: T): T = a > b ? a : b;
def main(): int {
    let x = max!<int>(1, 2);
    let y = max!<int>(3, 4);
    let z = max!<f64>(1.0, 2.0);
    return x + y;
}
"#,
    );
    let names: Vec<_> = l.module.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names.iter().filter(|n| **n == "max_int").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "max_f64").count(), 1);
    let stmts = body(&l, "main");
    assert!(matches!(
        &stmts[0],
        IrStmt::Decl { ty: IrType::Builtin(BuiltinType::Int), .. }
    ));
}

#[test]
fn capabilities_become_leading_fields_and_members_are_promoted() {
    let l = lowered(
        r#"
struct Readable { cursor: int; }
struct Writeable { dirty: bool; }
struct Data : (Load = Readable, Save = Writeable) { field: int; }
def touch(d: *Data): int {
    d->dirty = true;
    return d->cursor + d->field;
}
"#,
    );
    let data = l.module.aggregate("Data").expect("Data");
    let fields: Vec<_> = data.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(fields, vec!["Load", "Save", "field"]);
    assert_eq!(data.capabilities, vec!["Load", "Save"]);

    let stmts = body(&l, "touch");
    let IrStmt::Expr(IrExpr::Binary { lhs, .. }) = &stmts[0] else {
        panic!("expected assignment, got {:?}", stmts[0]);
    };
    let IrExpr::Member { base, field } = lhs.as_ref() else {
        panic!("expected promoted member, got {lhs:?}");
    };
    assert_eq!(field, "dirty");
    assert!(matches!(base.as_ref(), IrExpr::Arrow { field, .. } if field == "Save"));
}

#[test]
fn unknown_member_is_rejected() {
    let src = "struct P { x: int; } def f(p: P): int = p.y;";
    assert_eq!(lower_err(src), LoweringErrorKind::UnknownMember);
}

#[test]
fn capability_must_name_a_struct() {
    let src = "union U { a: int; } struct S : U { }";
    assert_eq!(lower_err(src), LoweringErrorKind::Unrepresentable);
}

#[test]
fn aggregates_containing_each_other_are_rejected() {
    let src = "struct A { b: B; } struct B { a: A; }";
    assert_eq!(lower_err(src), LoweringErrorKind::CyclicAggregate);
    // Through a pointer the cycle is fine.
    assert!(lower_src("struct A { b: B; } struct B { a: *A; }").is_ok());
}

#[test]
fn integer_literals_are_range_checked() {
    assert_eq!(lower_err("var x: u8 = 256;"), LoweringErrorKind::IntegerOutOfRange);
    assert_eq!(lower_err("var x: i8 = -129;"), LoweringErrorKind::IntegerOutOfRange);
    assert_eq!(
        lower_err("def f(x: u16): void; def g(): void { f(70000); }"),
        LoweringErrorKind::IntegerOutOfRange
    );

    let l = lowered("var x: i8 = -128; var big = 0xffff_ffff_ffff_ffff;");
    assert_eq!(
        l.module.globals[0].init,
        Some(IrExpr::Int(IrInt {
            magnitude: 128,
            negative: true
        }))
    );
    assert_eq!(l.module.globals[1].ty, IrType::Builtin(BuiltinType::U64));
}

#[test]
fn default_arguments_are_filled_at_call_sites() {
    let l = lowered(
        r#"
def open(path: *const char, mode: int = 4, flags: int = 0): int;
def main(): int = open("a", 1);
"#,
    );
    let stmts = body(&l, "main");
    let IrStmt::Return(Some(IrExpr::Call { args, .. })) = &stmts[0] else {
        panic!("expected call, got {:?}", stmts[0]);
    };
    assert_eq!(args.len(), 3);
    assert_eq!(args[2], IrExpr::int(0));

    let src = "def f(a: int, b: int = 1): int; def g(): int = f();";
    assert_eq!(lower_err(src), LoweringErrorKind::ArgumentCount);
    let src = "def f(a: int): int; def g(): int = f(1, 2);";
    assert_eq!(lower_err(src), LoweringErrorKind::ArgumentCount);
}

#[test]
fn unwrap_of_pointer_hoists_and_returns_early() {
    let l = lowered(
        r#"
def find(key: int): *int;
def lookup(key: int): int {
    let p = unwrap! find(key);
    return *p;
}
"#,
    );
    let stmts = body(&l, "lookup");
    let IrStmt::Decl { name, init: Some(IrExpr::Call { .. }), .. } = &stmts[0] else {
        panic!("expected temporary, got {:?}", stmts[0]);
    };
    assert_eq!(name, "unwrap_tmp0");
    let IrStmt::If { cond, then, otherwise: None } = &stmts[1] else {
        panic!("expected early return, got {:?}", stmts[1]);
    };
    assert_eq!(
        *cond,
        IrExpr::binary(BinOp::Eq, IrExpr::name("unwrap_tmp0"), IrExpr::Null)
    );
    assert_eq!(then, &vec![IrStmt::Return(Some(IrExpr::int(0)))]);
    assert!(matches!(&stmts[2], IrStmt::Decl { name, init: Some(IrExpr::Name(tmp)), .. } if name == "p" && tmp == "unwrap_tmp0"));
}

#[test]
fn unwrap_of_optional_struct_reads_value() {
    let l = lowered(
        r#"
struct MaybeInt { is_some: bool; value: int; }
def get(): MaybeInt;
def use_it(): void {
    let v = unwrap! get();
}
"#,
    );
    let stmts = body(&l, "use_it");
    let IrStmt::If { cond, then, .. } = &stmts[1] else {
        panic!("expected early return, got {:?}", stmts[1]);
    };
    assert!(matches!(cond, IrExpr::Unary { op: UnaryOp::Not, .. }));
    assert_eq!(then, &vec![IrStmt::Return(None)]);
    let IrStmt::Decl { ty, init: Some(init), .. } = &stmts[2] else {
        panic!("expected binding, got {:?}", stmts[2]);
    };
    assert_eq!(*ty, IrType::Builtin(BuiltinType::Int));
    assert_eq!(*init, IrExpr::member(IrExpr::name("unwrap_tmp0"), "value"));
}

#[test]
fn unwrap_in_loop_condition_is_unrepresentable() {
    let src = r#"
def next(): *int;
def drain(): void {
    while unwrap! next() { }
}
"#;
    assert_eq!(lower_err(src), LoweringErrorKind::Unrepresentable);
    let src = "def f(): int; def g(): void { let x = unwrap! f(); }";
    assert_eq!(lower_err(src), LoweringErrorKind::Unrepresentable);
}

#[test]
fn elvis_reuses_pure_operands() {
    let l = lowered("def pick(a: *int, b: *int): *int = a ?: b;");
    let stmts = body(&l, "pick");
    let IrStmt::Return(Some(IrExpr::Ternary { cond, then, .. })) = &stmts[0] else {
        panic!("expected ternary, got {:?}", stmts[0]);
    };
    assert_eq!(**cond, IrExpr::name("a"));
    assert_eq!(**then, IrExpr::name("a"));
}

#[test]
fn decorators_set_linkage_and_warn_when_unknown() {
    let l = lowered(
        r#"
@opaque struct Handle {}
@inline def a(): int = 1;
@internal def b(): int = 2;
@[inline, target(i8086)] def c(): int = 3;
"#,
    );
    assert!(l.module.aggregate("Handle").is_some_and(|h| h.opaque));
    assert_eq!(l.module.function("a").map(|f| f.linkage), Some(Linkage::Inline));
    assert_eq!(l.module.function("b").map(|f| f.linkage), Some(Linkage::Internal));
    assert_eq!(l.warnings.len(), 1);
    assert!(l.warnings[0].message.contains("@target"));
}

#[test]
fn opaque_types_cannot_be_held_by_value() {
    assert_eq!(
        lower_err("@opaque struct Handle {} var h: Handle;"),
        LoweringErrorKind::Unrepresentable
    );
    assert!(lower_src("@opaque struct Handle {} var h: *Handle;").is_ok());
}

#[test]
fn closures_share_typedefs_by_shape() {
    let l = lowered(
        r#"
using cb = void(int, int);
var on_a: void(int, int);
var on_b: cb;
var on_c: int();
"#,
    );
    let names: Vec<_> = l.module.closures.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["fn_void_of_int_int", "fn_int_of_void"]);
}

#[test]
fn range_loops_count_and_iterate() {
    let l = lowered(
        r#"
def sum(xs: [int : 4]): int {
    var total: int = 0;
    for i .. 10 { total += i; }
    for i, x .. xs { total += x; }
    return total;
}
"#,
    );
    let stmts = body(&l, "sum");
    let IrStmt::For { cond: Some(cond), .. } = &stmts[1] else {
        panic!("expected counting loop, got {:?}", stmts[1]);
    };
    assert_eq!(*cond, IrExpr::binary(BinOp::Lt, IrExpr::name("i"), IrExpr::int(10)));

    let IrStmt::For { cond: Some(cond), body, .. } = &stmts[2] else {
        panic!("expected array loop, got {:?}", stmts[2]);
    };
    assert_eq!(*cond, IrExpr::binary(BinOp::Lt, IrExpr::name("i"), IrExpr::int(4)));
    assert!(matches!(&body[0], IrStmt::Decl { name, .. } if name == "x"));
}

#[test]
fn enum_members_are_prefixed() {
    let l = lowered("enum Color : u8 { Red = 1; Green; } def f(): Color = Color::Green;");
    let members: Vec<_> = l.module.enums[0].members.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(members, vec!["Color_Red", "Color_Green"]);
    let stmts = body(&l, "f");
    assert_eq!(stmts[0], IrStmt::Return(Some(IrExpr::name("Color_Green"))));
}

#[test]
fn untyped_binding_without_initializer_type_is_uninferable() {
    let src = "using ext::api(make); def f(): void { let x = make(); }";
    assert_eq!(lower_err(src), LoweringErrorKind::UninferableType);
}

#[test]
fn array_bounds_are_evaluated() {
    let l = lowered("var buf: [u8 : 4 * 16];");
    assert_eq!(
        l.module.globals[0].ty,
        IrType::Array {
            elem: Box::new(IrType::Builtin(BuiltinType::U8)),
            bound: Some(64)
        }
    );
}

#[test]
fn defaults_see_the_callee_parameters() {
    let l = lowered(
        r#"
def f(a: int, b: int = a): int = a + b;
def tick(): int;
def g(a: int): int { return f(1); }
def h(): int { return f(tick()); }
"#,
    );
    assert_eq!(
        body(&l, "g"),
        &[IrStmt::Return(Some(IrExpr::Call {
            callee: Box::new(IrExpr::name("f")),
            args: vec![IrExpr::int(1), IrExpr::int(1)],
        }))]
    );

    // An argument with side effects is evaluated once and shared.
    let stmts = body(&l, "h");
    let IrStmt::Decl { name, init: Some(IrExpr::Call { .. }), .. } = &stmts[0] else {
        panic!("expected temporary, got {:?}", stmts[0]);
    };
    assert_eq!(name, "arg_tmp0");
    assert_eq!(
        stmts[1],
        IrStmt::Return(Some(IrExpr::Call {
            callee: Box::new(IrExpr::name("f")),
            args: vec![IrExpr::name("arg_tmp0"), IrExpr::name("arg_tmp0")],
        }))
    );
}

#[test]
fn default_naming_a_shadowed_global_is_rejected() {
    let src = "var k: int = 3; def f(a: int = k): int; def g(k: int): int = f();";
    assert_eq!(lower_err(src), LoweringErrorKind::Unrepresentable);
    assert!(lower_src("var k: int = 3; def f(a: int = k): int; def g(j: int): int = f();").is_ok());
}

#[test]
fn instance_names_never_collide_with_declarations() {
    let l = lowered(
        r#"
struct Box!<T> { value: T; }
struct Box_i32 { raw: i32; }
var a: Box!<i32>;
var b: Box_i32;
"#,
    );
    let names: Vec<_> = l.module.aggregates.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["Box_i32", "Box_i32_1"]);
    assert_eq!(l.module.globals[0].ty, IrType::Named("Box_i32_1".into()));
    assert_eq!(l.module.globals[1].ty, IrType::Named("Box_i32".into()));

    let l = lowered(
        r#"
struct Foo!<T> { v: T; }
struct Foo_Bar!<T> { v: T; }
struct Bar_i32 { x: i32; }
var a: Foo_Bar!<i32>;
var b: Foo!<Bar_i32>;
"#,
    );
    let names: Vec<_> = l.module.aggregates.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, vec!["Bar_i32", "Foo_Bar_i32", "Foo_Bar_i32_1"]);
}

#[test]
fn runaway_instantiation_is_an_error() {
    let src = "struct W!<T> { p: *W!<*T>; } var w: W!<i32>;";
    let err = lower_src(src).err().expect("nesting limit");
    assert_eq!(err.kind, LoweringErrorKind::Unrepresentable);
    assert!(err.message.starts_with("template instances nest deeper than"), "{}", err.message);
    assert!(err.message.contains("W_i32 -> W_ptr_i32 -> "), "{}", err.message);

    let src = r#"
def g!<T>(x: *T): void { g!<*T>(null); }
def main(): void { g!<i32>(null); }
"#;
    let err = lower_src(src).err().expect("nesting limit");
    assert_eq!(err.kind, LoweringErrorKind::Unrepresentable);
    assert!(err.message.contains("g_i32 -> g_ptr_i32 -> "), "{}", err.message);
}
