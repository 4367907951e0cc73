use syntax::{EditSpan, Language, LanguageRegistry};

#[test]
fn typescript_arity_mismatch_is_reported() {
    let registry = LanguageRegistry::default();
    let source = "function scale(value: number, factor?: number): number {\n  return value * (factor ?? 2);\n}\n\nexport function run(): number {\n  return scale(1, 2, 3);\n}\n";

    let backend = registry.for_file("src/scale.ts", source).unwrap();
    let tree = backend.parse(source).unwrap();
    let symbols = backend.extract_symbols(&tree);

    let mismatches = symbols.arity_mismatches(Language::TypeScript);
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].call.name, "scale");
    assert_eq!(mismatches[0].call.line, 5);
    assert_eq!(mismatches[0].expected[0].max_arity, Some(2));
}

#[test]
fn rust_associated_functions_are_not_checked_bare() {
    let registry = LanguageRegistry::default();
    let source = "struct Point;\n\nimpl Point {\n    fn new(x: i32, y: i32) -> Self { Point }\n}\n\nfn new() -> Point {\n    Point::new(1, 2)\n}\n\nfn main() {\n    let _ = new();\n}\n";

    let backend = registry.for_file("src/main.rs", source).unwrap();
    let tree = backend.parse(source).unwrap();

    assert!(tree.symbols.arity_mismatches(Language::Rust).is_empty());
    assert_eq!(tree.symbols.function_at_line(3).map(|f| f.depth), Some(1));
}

#[test]
fn edit_that_touches_item_boundary_reparses_whole_file() {
    let registry = LanguageRegistry::default();
    let backend = registry.backend(Language::Rust).unwrap();

    let before = "fn a() {\n    one();\n}\n";
    let after = "fn a(x: u8) {\n    one();\n}\n";
    let prior = backend.parse(before).unwrap();

    let edit = EditSpan::from_new_lines(0..1, prior.line_count, 4);
    let tree = backend.incremental_parse(&prior, after, &edit).unwrap();

    assert_eq!(tree, backend.parse(after).unwrap());
    assert_eq!(tree.symbols.functions[0].min_arity, 1);
}
