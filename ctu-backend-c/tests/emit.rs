use ctu_backend_c::{EmitOptions, emit};
use ctu_ir::{
    AggregateKind, BinOp, BuiltinType, IrAggregate, IrAlias, IrClosure, IrEnum, IrExpr, IrField, IrFunction,
    IrGlobal, IrInclude, IrModule, IrStmt, IrType, Linkage,
};

fn int() -> IrType {
    IrType::Builtin(BuiltinType::Int)
}

fn field(name: &str, ty: IrType) -> IrField {
    IrField {
        name: name.to_string(),
        ty,
    }
}

fn aggregate(name: &str, fields: Vec<IrField>) -> IrAggregate {
    IrAggregate {
        kind: AggregateKind::Struct,
        name: name.to_string(),
        fields,
        capabilities: vec![],
        opaque: false,
    }
}

fn function(name: &str, body: Option<Vec<IrStmt>>) -> IrFunction {
    IrFunction {
        name: name.to_string(),
        args: vec![],
        result: int(),
        body,
        linkage: Linkage::External,
        position: Default::default(),
    }
}

fn sample() -> IrModule {
    IrModule {
        unit: "sample".into(),
        includes: vec![IrInclude {
            path: vec!["std".into(), "io".into()],
        }],
        enums: vec![IrEnum {
            name: "Color".into(),
            backing: Some(IrType::Builtin(BuiltinType::U8)),
            members: vec![("Color_Red".into(), Some(IrExpr::int(1))), ("Color_Green".into(), None)],
        }],
        closures: vec![IrClosure {
            name: "fn_void_of_int".into(),
            args: vec![int()],
            result: IrType::void(),
        }],
        aliases: vec![IrAlias {
            name: "handle".into(),
            ty: IrType::Pointer(Box::new(IrType::void())),
        }],
        aggregates: vec![
            aggregate("Outer", vec![field("inner", IrType::Named("Inner".into()))]),
            aggregate("Inner", vec![field("v", int())]),
        ],
        globals: vec![IrGlobal {
            name: "counter".into(),
            ty: int(),
            init: Some(IrExpr::int(0)),
        }],
        functions: vec![
            function("ext", None),
            function("main", Some(vec![IrStmt::Return(Some(IrExpr::int(0)))])),
        ],
    }
}

fn index_of(text: &str, needle: &str) -> usize {
    text.find(needle)
        .unwrap_or_else(|| panic!("`{needle}` missing from:\n{text}"))
}

#[test]
fn sections_appear_in_fixed_order() {
    let c = emit(&sample(), &EmitOptions::default());
    let marks = [
        "#include <stddef.h>",
        "#include <stdint.h>",
        "#include \"std/io.h\"",
        "typedef struct Outer Outer;",
        "enum Color {",
        "typedef uint8_t Color;",
        "typedef void (*fn_void_of_int)(int);",
        "typedef void *handle;",
        "struct Inner {",
        "struct Outer {",
        "int counter = 0;",
        "int ext(void);",
        "int main(void) {",
    ];
    let positions: Vec<_> = marks.iter().map(|m| index_of(&c, m)).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted, "sections out of order:\n{c}");
}

#[test]
fn emission_is_deterministic() {
    let module = sample();
    let options = EmitOptions {
        line_directives: true,
        banner: true,
    };
    assert_eq!(emit(&module, &options), emit(&module, &options));
}

#[test]
fn prototypes_only_for_bodiless_functions() {
    let c = emit(&sample(), &EmitOptions::default());
    assert!(c.contains("int ext(void);"));
    assert!(!c.contains("int ext(void) {"));
}

#[test]
fn enum_members_are_comma_separated() {
    let c = emit(&sample(), &EmitOptions::default());
    assert!(c.contains("    Color_Red = 1,\n    Color_Green\n};"), "{c}");
}

#[test]
fn line_directives_and_banner_are_opt_in() {
    let mut module = sample();
    module.functions[1].position.line = 7;
    let plain = emit(&module, &EmitOptions::default());
    assert!(!plain.contains("#line"));
    assert!(!plain.contains("Generated by ctu"));

    let annotated = emit(
        &module,
        &EmitOptions {
            line_directives: true,
            banner: true,
        },
    );
    assert!(annotated.starts_with("/* Generated by ctu from unit `sample`."));
    assert!(annotated.contains("#line 7 \"sample\"\nint main(void) {"), "{annotated}");
}

#[test]
fn control_flow_renders_as_c() {
    let body = vec![
        IrStmt::If {
            cond: IrExpr::name("a"),
            then: vec![IrStmt::Return(Some(IrExpr::int(1)))],
            otherwise: Some(vec![IrStmt::If {
                cond: IrExpr::name("b"),
                then: vec![IrStmt::Return(Some(IrExpr::int(2)))],
                otherwise: Some(vec![IrStmt::Return(Some(IrExpr::int(3)))]),
            }]),
        },
        IrStmt::Switch {
            scrutinee: IrExpr::name("x"),
            cases: vec![(IrExpr::name("Color_Red"), vec![IrStmt::Expr(IrExpr::binary(
                BinOp::Assign,
                IrExpr::name("y"),
                IrExpr::int(4),
            ))])],
            default: Some(vec![IrStmt::Break]),
        },
        IrStmt::For {
            init: Some(Box::new(IrStmt::Decl {
                name: "i".into(),
                ty: int(),
                init: Some(IrExpr::int(0)),
            })),
            cond: Some(IrExpr::binary(BinOp::Lt, IrExpr::name("i"), IrExpr::int(10))),
            step: Some(IrExpr::binary(BinOp::AddAssign, IrExpr::name("i"), IrExpr::int(1))),
            body: vec![IrStmt::Continue],
        },
    ];
    let module = IrModule {
        unit: "flow".into(),
        functions: vec![function("f", Some(body))],
        ..IrModule::default()
    };
    let c = emit(&module, &EmitOptions::default());
    let expected = "\
int f(void) {
    if (a) {
        return 1;
    } else if (b) {
        return 2;
    } else {
        return 3;
    }
    switch (x) {
    case Color_Red: {
        y = 4;
        break;
    }
    default: {
        break;
        break;
    }
    }
    for (int i = 0; i < 10; i += 1) {
        continue;
    }
}
";
    assert!(c.trim_end().ends_with(expected.trim_end()), "got:\n{c}");
}

#[test]
fn aliases_embedding_an_aggregate_follow_its_definition() {
    let module = IrModule {
        unit: "alias".into(),
        aliases: vec![
            IrAlias {
                name: "Ps".into(),
                ty: IrType::Array {
                    elem: Box::new(IrType::Named("P".into())),
                    bound: Some(3),
                },
            },
            IrAlias {
                name: "PRef".into(),
                ty: IrType::Pointer(Box::new(IrType::Named("P".into()))),
            },
        ],
        aggregates: vec![aggregate("P", vec![field("x", int())])],
        globals: vec![IrGlobal {
            name: "points".into(),
            ty: IrType::Named("Ps".into()),
            init: None,
        }],
        ..IrModule::default()
    };
    let c = emit(&module, &EmitOptions::default());
    assert!(index_of(&c, "typedef P *PRef;") < index_of(&c, "struct P {"), "{c}");
    assert!(index_of(&c, "struct P {") < index_of(&c, "typedef P Ps[3];"), "{c}");
    assert!(index_of(&c, "typedef P Ps[3];") < index_of(&c, "Ps points;"), "{c}");
}
