//! End-to-end compiler scenarios: a project written to a
//! `tempfile` directory tree, compiled through the public `Project`/
//! `Compiler` surface, and asserted against the fixed diagnostic taxonomy.

use indoc::indoc;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use typedown::diagnostic::ErrorCode;
use typedown::project::{CompileOptions, Compiler, Project, Stage};
use typedown::query::QueryEngine;

fn write(dir: &std::path::Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn project_at(dir: &std::path::Path) -> Compiler {
    let project = Project::discover(dir).unwrap();
    Compiler::new(project)
}

/// Scenario 1: happy path. `check global` is clean and `query "alice.name"`
/// returns `"Alice"`.
#[test]
fn happy_path_compiles_clean_and_queries_resolve() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "[package]\nname = \"demo\"\n");
    write(
        root,
        "models/user.td",
        indoc! {"
            ```model:User
            record User { name: str, email: str }
            ```
        "},
    );
    write(
        root,
        "entities/alice.td",
        indoc! {"
            ```entity User: alice
            name: Alice
            email: a@x
            ```
        "},
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert!(!result.diagnostics.has_errors(), "{:?}", result.diagnostics.iter().collect::<Vec<_>>());

    let engine = QueryEngine::new(&result.table, &result.store, root);
    let value = engine.resolve_query("alice.name", &root.join("typedown.toml")).unwrap();
    assert_eq!(value, serde_json::Value::String("Alice".to_string()));
}

/// Scenario 2: reference type mismatch. An `Order.buyer: Ref[User]` field
/// pointed at a `Product` entity yields exactly one E0362 naming both
/// classes.
#[test]
fn reference_type_mismatch_is_e0362_with_expected_and_actual() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str }\n```\n",
    );
    write(
        root,
        "models/product.td",
        "```model:Product\nrecord Product { name: str }\n```\n",
    );
    write(
        root,
        "models/order.td",
        "```model:Order\nrecord Order { buyer: Ref[User] }\n```\n",
    );
    write(root, "entities/alice.td", "```entity User: alice\nname: Alice\n```\n");
    write(
        root,
        "entities/laptop.td",
        "```entity Product: laptop\nname: Laptop\n```\n",
    );
    write(
        root,
        "entities/bad.td",
        "```entity Order: o1\nbuyer: \"[[laptop]]\"\n```\n",
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());

    let mismatches = result.diagnostics.by_code(ErrorCode::E0362);
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].details["expected"], "User");
    assert_eq!(mismatches[0].details["actual"], "Product");
}

/// Scenario 3: evolution chain. `doc-v1 <- doc-v2 <- doc-v3` via `former`
/// passes cleanly and topologically orders v1 before v2 before v3;
/// replacing v3's former with a dangling target yields exactly one E0343.
#[test]
fn evolution_chain_orders_and_flags_dangling_former() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/doc.td",
        "```model:Doc\nrecord Doc { title: str, former: str = \"\" }\n```\n",
    );
    write(root, "entities/v1.td", "```entity Doc: doc-v1\ntitle: one\n```\n");
    write(
        root,
        "entities/v2.td",
        "```entity Doc: doc-v2\ntitle: two\nformer: \"[[doc-v1]]\"\n```\n",
    );
    write(
        root,
        "entities/v3.td",
        "```entity Doc: doc-v3\ntitle: three\nformer: \"[[doc-v2]]\"\n```\n",
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert!(!result.diagnostics.has_errors(), "{:?}", result.diagnostics.iter().collect::<Vec<_>>());

    // Break v3's former target.
    write(
        root,
        "entities/v3.td",
        "```entity Doc: doc-v3\ntitle: three\nformer: \"[[doc-vX]]\"\n```\n",
    );
    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert_eq!(result.diagnostics.by_code(ErrorCode::E0343).len(), 1);
}

/// Scenario 4: cycle. `A.former = [[B]]`, `B.former = [[A]]` yields exactly
/// one E0342 naming both ids in `details.cycle`, and no E0341 diagnostics
/// for either entity.
#[test]
fn former_cycle_is_e0342_with_no_e0341_fallout() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/doc.td",
        "```model:Doc\nrecord Doc { former: str = \"\" }\n```\n",
    );
    write(root, "entities/a.td", "```entity Doc: A\nformer: \"[[B]]\"\n```\n");
    write(root, "entities/b.td", "```entity Doc: B\nformer: \"[[A]]\"\n```\n");

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());

    let cycles = result.diagnostics.by_code(ErrorCode::E0342);
    assert_eq!(cycles.len(), 1);
    let cycle = cycles[0].details["cycle"].as_array().unwrap();
    let names: Vec<&str> = cycle.iter().map(|v| v.as_str().unwrap()).collect();
    assert!(names.contains(&"A"));
    assert!(names.contains(&"B"));
    assert!(result.diagnostics.by_code(ErrorCode::E0341).is_empty());
}

/// Scenario 6: query with property path, including the terminal-wildcard
/// and missing-segment edge cases.
#[test]
fn query_walks_property_path_and_wildcard() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str, profile: map[str] }\n```\n",
    );
    write(
        root,
        "entities/alice.td",
        indoc! {"
            ```entity User: alice
            name: Alice
            profile:
              email: a@x
            ```
        "},
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert!(!result.diagnostics.has_errors());

    let engine = QueryEngine::new(&result.table, &result.store, root);
    let context = root.join("typedown.toml");

    let email = engine.resolve_query("alice.profile.email", &context).unwrap();
    assert_eq!(email, serde_json::Value::String("a@x".to_string()));

    let whole = engine.resolve_query("alice.profile.*", &context).unwrap();
    assert_eq!(whole, serde_json::json!({"email": "a@x"}));

    let err = engine.resolve_query("alice.missing", &context).unwrap_err();
    assert_eq!(err.code(), ErrorCode::E0365);
}

/// Duplicate ids in two sibling files produce exactly one E0241.
#[test]
fn duplicate_id_in_sibling_files_is_single_e0241() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str }\n```\n",
    );
    write(root, "entities/a.td", "```entity User: dup\nname: First\n```\n");
    write(root, "entities/b.td", "```entity User: dup\nname: Second\n```\n");

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert_eq!(result.diagnostics.by_code(ErrorCode::E0241).len(), 1);
}

/// Entity body declaring a top-level `id:` key is exactly one E0363.
#[test]
fn entity_with_explicit_id_key_is_e0363() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str }\n```\n",
    );
    write(
        root,
        "entities/alice.td",
        "```entity User: alice\nid: alice\nname: Alice\n```\n",
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert_eq!(result.diagnostics.by_code(ErrorCode::E0363).len(), 1);
}

/// Empty file: valid, no diagnostics.
#[test]
fn empty_project_file_produces_no_diagnostics() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(root, "notes.td", "");

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert!(result.diagnostics.is_empty());
}

/// Progressive `check` stages: a structural failure at the schema stage
/// stops the pipeline before the global stage runs (no E0362/E0341 noise).
#[test]
fn structural_failure_aborts_later_stages() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str, email: str }\n```\n",
    );
    write(root, "entities/alice.td", "```entity User: alice\nname: Alice\n```\n");

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions {
        target: None,
        stage: Stage::Global,
    });

    assert_eq!(result.diagnostics.by_code(ErrorCode::E0361).len(), 1);
    assert!(result.diagnostics.by_code(ErrorCode::E0362).is_empty());
}

/// Spec blocks: an `assert` directive over a local-scope selector fails for
/// an out-of-range field.
#[test]
fn spec_assertion_failure_is_e0424() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { age: int }\n```\n",
    );
    write(root, "entities/alice.td", "```entity User: alice\nage: 10\n```\n");
    write(
        root,
        "specs/adult.td",
        indoc! {r#"
            ```spec:adults-only
            @target(User, local)
            assert self.age >= 18
            ```
        "#},
    );

    let compiler = project_at(root);
    let result = compiler.compile(&CompileOptions::default());
    assert_eq!(result.diagnostics.by_code(typedown::diagnostic::ErrorCode::E0424).len(), 1);
}

/// Running `check global` twice on an unchanged project yields identical
/// diagnostic lists.
#[test]
fn repeated_compiles_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "typedown.toml", "");
    write(
        root,
        "models/user.td",
        "```model:User\nrecord User { name: str }\n```\n",
    );
    write(root, "entities/alice.td", "```entity User: alice\nname: Alice\n```\n");

    let compiler = project_at(root);
    let first = compiler.compile(&CompileOptions::default());
    let second = compiler.compile(&CompileOptions::default());

    let render = |r: &typedown::diagnostic::DiagnosticReport| {
        r.iter().map(|d| d.to_wire().to_string()).collect::<Vec<_>>()
    };
    assert_eq!(render(&first.diagnostics), render(&second.diagnostics));
}
