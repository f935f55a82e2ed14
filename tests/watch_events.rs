//! End-to-end watcher behaviour on a real filesystem: event filtering,
//! directory auto-watching, and engine-level triggering.

use std::time::Duration;

use tokio::sync::mpsc;

use watchtree::glob;
use watchtree::types::{ExecRequest, StatusEvent, TargetStatus, PRE_DEBOUNCE};
use watchtree::watch::{FsWatcher, TargetWatcher};
use watchtree_test_utils::{
    init_tracing, status_is, wait_for_event, ConfigBuilder, ProjectDir, TargetBuilder,
};

/// Wire a single target's watcher + filter manually, exposing the raw
/// request stream and the auto-added-path channel.
async fn spawn_target_watcher(
    target: watchtree::target::Target,
) -> (
    mpsc::Receiver<ExecRequest>,
    mpsc::Receiver<std::path::PathBuf>,
    FsWatcher,
) {
    let results = glob::expand(&target.include, &target.exclude).unwrap();
    let include: std::collections::HashMap<_, _> =
        glob::combine(&results).into_iter().collect();

    let watcher = FsWatcher::spawn().unwrap();
    watcher.set_debounce(PRE_DEBOUNCE);
    let events = watcher.subscribe();
    for path in include.keys() {
        watcher.add_path(path.clone()).await.unwrap();
    }

    let (exec_tx, exec_rx) = mpsc::channel(64);
    let (added_tx, added_rx) = mpsc::channel(64);
    TargetWatcher::new(target, include, watcher.clone(), exec_tx)
        .with_added_paths(added_tx)
        .spawn(events);

    (exec_rx, added_rx, watcher)
}

#[tokio::test]
async fn write_emits_request_with_matched_include() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.write("main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();
    let target = cfg.targets[0].clone();

    let (mut exec_rx, _added_rx, watcher) = spawn_target_watcher(target).await;

    // Give the watcher a beat before generating activity.
    tokio::time::sleep(Duration::from_millis(100)).await;
    proj.write("main.go", "package main // edited\n");

    let req = tokio::time::timeout(Duration::from_secs(5), exec_rx.recv())
        .await
        .expect("no request after write")
        .expect("request stream closed");

    assert_eq!(req.cause, "watcher");
    assert_eq!(req.target_id, "app");
    assert_eq!(req.event.path, file);
    assert_eq!(
        req.include.pattern,
        format!("{}/**/*.go", proj.root().display())
    );
    assert_eq!(req.tree.len(), 1);

    watcher.close();
}

#[tokio::test]
async fn new_directory_is_auto_watched_and_its_files_trigger() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();
    let target = cfg.targets[0].clone();

    let (mut exec_rx, mut added_rx, watcher) = spawn_target_watcher(target).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A new directory joins the watch set without triggering anything.
    let newdir = proj.mkdir("newdir");
    let added = tokio::time::timeout(Duration::from_secs(5), added_rx.recv())
        .await
        .expect("new directory was not auto-watched")
        .expect("added-path stream closed");
    assert_eq!(added, newdir);
    assert!(
        exec_rx.try_recv().is_err(),
        "directory creation must not trigger a run"
    );

    // A matching file created inside it does trigger.
    let file = proj.write("newdir/x.go", "package x\n");
    let req = tokio::time::timeout(Duration::from_secs(5), exec_rx.recv())
        .await
        .expect("no request for file in auto-watched directory")
        .expect("request stream closed");
    assert_eq!(req.event.path, file);

    watcher.close();
}

#[tokio::test]
async fn excluded_and_unmatched_paths_do_not_trigger() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("main.go", "package main\n");
    proj.write("notes.txt", "hi\n");
    proj.write("skip_me.go", "package skip\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .exclude("skip_*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();
    let target = cfg.targets[0].clone();

    let (mut exec_rx, _added_rx, watcher) = spawn_target_watcher(target).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    proj.write("notes.txt", "unmatched\n");
    proj.write("skip_me.go", "package skip // excluded\n");

    let got = tokio::time::timeout(Duration::from_millis(1500), exec_rx.recv()).await;
    assert!(got.is_err(), "unexpected request: {:?}", got);

    watcher.close();
}

#[tokio::test]
async fn removals_do_not_trigger() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.write("main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();
    let target = cfg.targets[0].clone();

    let (mut exec_rx, _added_rx, watcher) = spawn_target_watcher(target).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::remove_file(&file).unwrap();

    let got = tokio::time::timeout(Duration::from_millis(1500), exec_rx.recv()).await;
    assert!(got.is_err(), "removal produced a request: {:?}", got);

    watcher.close();
}

#[tokio::test]
async fn engine_runs_target_on_write() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.write("main.go", "package main\n");

    let cfg = ConfigBuilder::new()
        .cooldown("10ms")
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .debounce("200ms")
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();

    let mut engine = watchtree::start_engine(&cfg).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    proj.write("main.go", "package main // edit\n");

    wait_for_event(
        &mut engine.status_rx,
        Duration::from_secs(10),
        status_is("app", TargetStatus::Pending),
    )
    .await;
    wait_for_event(
        &mut engine.status_rx,
        Duration::from_secs(10),
        status_is("app", TargetStatus::Started),
    )
    .await;
    wait_for_event(&mut engine.status_rx, Duration::from_secs(10), |e| {
        matches!(e, StatusEvent::TreePass(p) if p.dispatch_target_id == "app")
    })
    .await;

    engine.stop();
}

#[tokio::test]
async fn auto_start_targets_run_at_startup() {
    init_tracing();
    let proj = ProjectDir::new();

    let cfg = ConfigBuilder::new()
        .cooldown("10ms")
        .auto_start("setup")
        .target(
            TargetBuilder::new("setup")
                .root(proj.root())
                .handler("init", &["true"])
                .build(),
        )
        .resolve();

    let mut engine = watchtree::start_engine(&cfg).await.unwrap();

    wait_for_event(
        &mut engine.status_rx,
        Duration::from_secs(10),
        status_is("setup", TargetStatus::Started),
    )
    .await;
    wait_for_event(&mut engine.status_rx, Duration::from_secs(10), |e| {
        matches!(e, StatusEvent::TreePass(p) if p.dispatch_target_id == "setup")
    })
    .await;

    engine.stop();
}
