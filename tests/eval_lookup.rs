//! Path evaluation against the configured include sets (the `eval`
//! subcommand's core).

use watchtree::eval_path;
use watchtree_test_utils::{init_tracing, ConfigBuilder, ProjectDir, TargetBuilder};

#[test]
fn matches_first_target_and_reports_tree() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.write("src/main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .target(
            TargetBuilder::new("deploy")
                .root(proj.root())
                .upstream("app")
                .handler("ship", &["true"])
                .build(),
        )
        .resolve();

    let (label, pattern, tree) = eval_path(&cfg, &file)
        .unwrap()
        .expect("expected a target match");
    assert_eq!(label, "app");
    assert_eq!(pattern, format!("{}/**/*.go", proj.root().display()));
    assert_eq!(tree, vec!["app".to_string(), "deploy".to_string()]);
}

#[test]
fn ancestor_directories_count_as_covered() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("src/deep/main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();

    // The intermediate directory is part of the watch set.
    let hit = eval_path(&cfg, &proj.root().join("src/deep")).unwrap();
    assert!(hit.is_some());
}

#[test]
fn unmatched_and_excluded_paths_miss() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("main.go", "package main\n");
    let excluded = proj.write("gen.go", "package gen\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .exclude("gen.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();

    assert!(eval_path(&cfg, &proj.root().join("README.md"))
        .unwrap()
        .is_none());
    assert!(eval_path(&cfg, &excluded).unwrap().is_none());
}

#[test]
fn global_excludes_apply_to_every_target() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("src/main.go", "package main\n");
    let vendored = proj.write("vendor/dep.go", "package dep\n");

    let cfg = ConfigBuilder::new()
        .global_exclude("vendor/**")
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();

    assert!(eval_path(&cfg, &vendored).unwrap().is_none());
    assert!(eval_path(&cfg, &proj.root().join("src/main.go"))
        .unwrap()
        .is_some());
}
