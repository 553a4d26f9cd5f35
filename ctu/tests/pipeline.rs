use ctu::{CompileOptions, Diagnostic, EmitOptions, Severity, SourceUnit, Stage, compile, compile_units, compile_with};
use proptest::prelude::*;

fn c_of(src: &str) -> String {
    compile("test", src).unwrap_or_else(|d| panic!("compile failed: {d:#?}"))
}

fn errors_of(src: &str) -> Vec<Diagnostic> {
    match compile("test", src) {
        Ok(c) => panic!("expected diagnostics, got:\n{c}"),
        Err(d) => d,
    }
}

fn index_of(text: &str, needle: &str) -> usize {
    text.find(needle)
        .unwrap_or_else(|| panic!("`{needle}` missing from:\n{text}"))
}

const SAMPLE: &str = r#"
using std::io;

struct Readable { cursor: int; }
struct Writeable { dirty: bool; }
struct Data : (Load = Readable, Save = Writeable) { field: int; }
struct Pair!<T, U> { first: T; second: U; }

enum Mode : u8 { Read; Write = 4; }

var origin: Pair!<i32, f32>;

def touch(d: *Data, m: Mode): int {
    if m == Mode::Write {
        d->dirty = true;
    }
    return d->cursor + d->field;
}
"#;

#[test]
fn output_is_deterministic() {
    assert_eq!(c_of(SAMPLE), c_of(SAMPLE));
}

#[test]
fn contained_aggregates_are_defined_first() {
    let c = c_of("struct Outer { inner: Inner; } struct Inner { v: int; }");
    assert!(index_of(&c, "struct Inner {") < index_of(&c, "struct Outer {"), "{c}");
}

#[test]
fn cyclic_aggregates_produce_no_text() {
    let diags = errors_of("struct A { b: B; } struct B { a: A; }");
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].stage, Stage::Lower);
    assert_eq!(diags[0].severity, Severity::Error);
    assert!(diags[0].message.contains("cyclic aggregate"), "{}", diags[0].message);
}

#[test]
fn cast_to_bool_is_a_parenthesized_c_cast() {
    let c = c_of("def f(): bool = cast!<bool>(100);");
    assert!(c.contains("return ((_Bool)100);"), "{c}");
}

#[test]
fn oversized_literals_survive_until_narrowed() {
    // Wider than 64 bits: lexing and parsing accept it, lowering rejects it.
    let diags = errors_of("var big: u64 = 340282366920938463463374607431768211456;");
    assert_eq!(diags[0].stage, Stage::Lower);
    assert!(diags[0].message.contains("integer out of range"), "{}", diags[0].message);

    let c = c_of("var max: u64 = 18446744073709551615;");
    assert!(c.contains("uint64_t max = UINT64_C(18446744073709551615);"), "{c}");
}

#[test]
fn template_instances_are_emitted_once() {
    let c = c_of(SAMPLE);
    assert_eq!(c.matches("struct Pair_i32_f32 {").count(), 1, "{c}");
    let c = c_of(&format!("{SAMPLE}\nvar other: Pair!<i32, f32>;"));
    assert_eq!(c.matches("struct Pair_i32_f32 {").count(), 1, "{c}");
}

#[test]
fn capability_slots_lead_the_struct() {
    let c = c_of(SAMPLE);
    let start = index_of(&c, "struct Data {");
    let data = &c[start..];
    let load = index_of(data, "Readable Load;");
    let save = index_of(data, "Writeable Save;");
    let field = index_of(data, "int field;");
    assert!(load < save && save < field, "{data}");
    assert!(c.contains("d->Save.dirty = 1;"), "{c}");
}

#[test]
fn unwrap_expands_to_an_early_return() {
    let c = c_of(
        r#"
def find(key: int): *int;
def lookup(key: int): int {
    let p = unwrap! find(key);
    return *p;
}
"#,
    );
    let expected = "\
    int *unwrap_tmp0 = find(key);
    if (unwrap_tmp0 == NULL) {
        return 0;
    }
    int *p = unwrap_tmp0;
    return *p;";
    assert!(c.contains(expected), "{c}");
}

#[test]
fn ignored_decorators_surface_as_warnings() {
    let compiled = compile_with(
        "test",
        "@target(i8086) def f(): int = 1;",
        &CompileOptions::default(),
    )
    .expect("compile");
    assert_eq!(compiled.warnings.len(), 1);
    assert_eq!(compiled.warnings[0].severity, Severity::Warning);
    assert_eq!(compiled.warnings[0].stage, Stage::Lower);
    assert!(compiled.c_source.contains("int f(void) {"));
}

#[test]
fn lex_errors_stop_the_unit() {
    let diags = errors_of("def f(): int = 1 $ 2;");
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].stage, Stage::Lex);
    assert_eq!(diags[0].position.column, 18);
}

#[test]
fn parse_and_scope_errors_are_reported_together() {
    let diags = errors_of(
        r#"
def f(): int {
    let x = ;
    return missing;
}
"#,
    );
    let stages: Vec<_> = diags.iter().map(|d| d.stage).collect();
    assert!(stages.contains(&Stage::Parse), "{diags:#?}");
    assert!(stages.contains(&Stage::Validate), "{diags:#?}");
    assert!(diags.iter().all(Diagnostic::is_error));
}

#[test]
fn unresolved_names_block_lowering() {
    let diags = errors_of("def f(): int = nope;");
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].stage, Stage::Validate);
    assert_eq!(diags[0].message, "unresolved name `nope`");
    assert_eq!(diags[0].to_string(), "validate error at 1:16: unresolved name `nope`");
}

#[test]
fn emit_options_are_applied() {
    let options = CompileOptions {
        emit: EmitOptions {
            line_directives: true,
            banner: true,
        },
    };
    let compiled = compile_with("unit.ctu", "\ndef f(): int = 1;", &options).expect("compile");
    assert!(compiled.c_source.starts_with("/* Generated by ctu"));
    assert!(compiled.c_source.contains("#line 2 \"unit.ctu\""), "{}", compiled.c_source);
}

#[test]
fn units_compile_independently_in_order() {
    let units = vec![
        SourceUnit::new("a", "def a(): int = 1;"),
        SourceUnit::new("b", "def b(): int = missing;"),
        SourceUnit::new("c", SAMPLE),
    ];
    let results = compile_units(&units, &CompileOptions::default());
    let names: Vec<_> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());
    assert_eq!(results[2].1.as_ref().map(|c| c.c_source.clone()), Ok(c_of(SAMPLE)));
}

proptest! {
    #[test]
    fn compiling_twice_gives_identical_text(
        fields in proptest::collection::btree_set("[a-z]{1,6}", 1..6),
        value in 0u32..100_000,
    ) {
        let mut src = String::from("struct S {");
        for f in &fields {
            src.push_str(&format!(" {f}_: u32;"));
        }
        src.push_str(&format!(" }}\nvar s: S;\ndef get(): u32 = {value};\n"));
        prop_assert_eq!(compile("p", &src), compile("p", &src));
        prop_assert!(compile("p", &src).is_ok());
    }
}
