use ctu_core::{validate, validate_with_resolutions};
use proptest::prelude::*;

fn unresolved(src: &str) -> Vec<String> {
    let unit = ctu_parse::parse_source(src).expect("parse");
    validate(&unit).into_iter().map(|e| e.name).collect()
}

#[test]
fn declared_names_resolve_in_any_order() {
    let src = r#"
using std::io;
using math::vec(dot, cross);

def main(): int {
    let v = dot(1, 2) + helper();
    io::print("x");
    return v;
}

def helper(): int = counter;
var counter: int = 0;
"#;
    assert!(unresolved(src).is_empty());
}

#[test]
fn missing_names_are_all_collected() {
    let src = r#"
def f(a: int): int {
    let b = a + missing;
    return other(b);
}
"#;
    assert_eq!(unresolved(src), vec!["missing", "other"]);
}

#[test]
fn locals_do_not_leak_out_of_blocks() {
    let src = r#"
def f(): int {
    {
        let inner = 1;
    }
    for i .. 10 { }
    return inner + i;
}
"#;
    assert_eq!(unresolved(src), vec!["inner", "i"]);
}

#[test]
fn initializer_sees_the_enclosing_binding() {
    let src = r#"
def f(x: int): int {
    {
        let x = x + 1;
        return x;
    }
}
"#;
    let unit = ctu_parse::parse_source(src).expect("parse");
    let (errors, resolutions) = validate_with_resolutions(&unit);
    assert!(errors.is_empty(), "{errors:?}");

    let xs: Vec<_> = resolutions.iter().filter(|r| r.name == "x").collect();
    assert_eq!(xs.len(), 2);
    // `x + 1` reaches the argument frame; `return x` the inner block.
    assert!(xs[0].depth < xs[1].depth, "{xs:?}");
    assert_eq!(xs[0].position.line, 4);
    assert_eq!(xs[1].position.line, 5);
}

#[test]
fn inner_binding_shadows_only_inside_its_block() {
    let src = r#"
def use(v: int): void;
def f(): void {
    let x = 1;
    {
        let x = 2;
        use(x);
    }
    use(x);
}
"#;
    let unit = ctu_parse::parse_source(src).expect("parse");
    let (errors, resolutions) = validate_with_resolutions(&unit);
    assert!(errors.is_empty(), "{errors:?}");

    let xs: Vec<_> = resolutions.iter().filter(|r| r.name == "x").collect();
    assert_eq!(xs.len(), 2);
    assert_eq!(xs[0].position.line, 7);
    assert_eq!(xs[1].position.line, 9);
    assert!(xs[0].depth > xs[1].depth, "{xs:?}");
}

#[test]
fn template_parameters_are_scoped_to_their_declaration() {
    let src = r#"
struct Pair!<T, U> { first: T; second: U; }
def id!<T>(x: T): T = x;
var bad: T;
"#;
    assert_eq!(unresolved(src), vec!["T"]);
}

#[test]
fn enum_members_are_checked() {
    let src = r#"
enum Color { Red; Green; }
def f(): Color = Color::Blue;
def g(): Color = Color::Green;
"#;
    assert_eq!(unresolved(src), vec!["Color::Blue"]);
}

#[test]
fn unresolved_error_carries_position() {
    let unit = ctu_parse::parse_source("def f(): int {\n    return nope;\n}").expect("parse");
    let errors = validate(&unit);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].position.line, 2);
    assert_eq!(errors[0].position.column, 12);
    assert!(errors[0].to_string().contains("unresolved name `nope`"));
}

proptest! {
    // Every reference either resolves or is reported, never both.
    #[test]
    fn every_reference_is_accounted_for(
        declared in proptest::collection::btree_set("[a-e]", 0..5),
        used in proptest::collection::vec("[a-e]", 1..6),
    ) {
        let mut src = String::new();
        for name in &declared {
            src.push_str(&format!("var {name}: int = 0;\n"));
        }
        src.push_str("def body_under_test(): void {\n");
        for name in &used {
            src.push_str(&format!("    {name};\n"));
        }
        src.push_str("}\n");

        let unit = ctu_parse::parse_source(&src).expect("parse");
        let (errors, resolutions) = validate_with_resolutions(&unit);

        let missing: Vec<_> = used.iter().filter(|u| !declared.contains(*u)).cloned().collect();
        let reported: Vec<_> = errors.iter().map(|e| e.name.clone()).collect();
        prop_assert_eq!(reported, missing);
        prop_assert!(resolutions.iter().all(|r| declared.contains(&r.name)));
    }
}
