//! Dispatcher behaviour: debounced dedup, queue replacement, cancellation
//! on new activity, fail-fast, timeouts, and tree ordering.

use std::time::Duration;

use tokio::sync::mpsc;

use watchtree::dispatch::Dispatcher;
use watchtree::types::{StatusEvent, TargetStatus};
use watchtree_test_utils::{
    init_tracing, status_is, wait_for_event, watcher_request, ConfigBuilder, ProjectDir,
    TargetBuilder,
};

const COOLDOWN: Duration = Duration::from_millis(10);

fn start_dispatcher() -> (
    Dispatcher,
    mpsc::Receiver<StatusEvent>,
    mpsc::Receiver<String>,
) {
    let (status_tx, status_rx) = mpsc::channel(256);
    let (panic_tx, panic_rx) = mpsc::channel(8);
    let dispatcher = Dispatcher::start(COOLDOWN, status_tx, panic_tx);
    (dispatcher, status_rx, panic_rx)
}

/// Assert that no further `Started` arrives for `target_id` within `window`.
async fn assert_no_more_starts(
    rx: &mut mpsc::Receiver<StatusEvent>,
    target_id: &str,
    window: Duration,
) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) else {
            return;
        };
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(StatusEvent::Status(status))) => {
                assert!(
                    !(status.target_id == target_id
                        && status.cause == Some(TargetStatus::Started)),
                    "unexpected extra start for [{target_id}]"
                );
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return,
        }
    }
}

#[tokio::test]
async fn burst_of_requests_runs_once() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .debounce("300ms")
                .include("**/*.go")
                .handler("build", &["true"])
                .build(),
        )
        .resolve();
    let target = &cfg.targets[0];

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    let requests = dispatcher.requests();

    for _ in 0..3 {
        requests.send(watcher_request(target, &file)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // One settled request: one pending, one start, one pass.
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(5),
        status_is("app", TargetStatus::Pending),
    )
    .await;
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(5),
        status_is("app", TargetStatus::Started),
    )
    .await;
    wait_for_event(&mut status_rx, Duration::from_secs(5), |e| {
        matches!(e, StatusEvent::TreePass(p) if p.dispatch_target_id == "app")
    })
    .await;

    assert_no_more_starts(&mut status_rx, "app", Duration::from_secs(2)).await;
    dispatcher.stop();
}

#[tokio::test]
async fn new_activity_cancels_in_flight_run() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("slow")
                .root(proj.root())
                .include("**/*.go")
                .handler("wait", &["sleep 30"])
                .build(),
        )
        .resolve();
    let target = &cfg.targets[0];

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    let requests = dispatcher.requests();

    requests.send(watcher_request(target, &file)).await.unwrap();
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(5),
        status_is("slow", TargetStatus::Started),
    )
    .await;

    // Second request invalidates the running command.
    let started = tokio::time::Instant::now();
    requests.send(watcher_request(target, &file)).await.unwrap();
    let canceled = wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("slow", TargetStatus::Canceled),
    )
    .await;

    let status = watchtree_test_utils::into_status(canceled);
    assert_eq!(status.err, "context canceled");
    assert!(!status.pids.is_empty());
    // SIGTERM should settle this well within the kill grace window.
    assert!(started.elapsed() < Duration::from_secs(8));

    dispatcher.stop();
}

#[tokio::test]
async fn newer_queued_request_replaces_older() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("slow")
                .root(proj.root())
                .include("**/*.go")
                .handler("wait", &["sleep 30"])
                .build(),
        )
        .resolve();
    let target = &cfg.targets[0];

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    let requests = dispatcher.requests();

    requests.send(watcher_request(target, &file)).await.unwrap();
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(5),
        status_is("slow", TargetStatus::Started),
    )
    .await;

    // Two more requests in quick succession: the first cancels the running
    // command and queues; the second replaces it in the queue. Only one
    // further run may happen.
    requests.send(watcher_request(target, &file)).await.unwrap();
    requests.send(watcher_request(target, &file)).await.unwrap();

    wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("slow", TargetStatus::Canceled),
    )
    .await;
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("slow", TargetStatus::Started),
    )
    .await;

    assert_no_more_starts(&mut status_rx, "slow", Duration::from_millis(2500)).await;
    dispatcher.stop();
}

#[tokio::test]
async fn failing_handler_stops_target_and_tree() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .cooldown("10ms")
        .target(
            TargetBuilder::new("up")
                .root(proj.root())
                .include("**/*.go")
                .handler("broken", &["ls /definitely/not/here"])
                .handler("never", &["echo ok"])
                .build(),
        )
        .target(
            TargetBuilder::new("down")
                .root(proj.root())
                .upstream("up")
                .handler("after", &["echo downstream"])
                .build(),
        )
        .resolve();
    let target = cfg.target_by_id("up").unwrap();
    assert_eq!(target.tree.len(), 2);

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    dispatcher
        .requests()
        .send(watcher_request(target, &file))
        .await
        .unwrap();

    let failed = wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("up", TargetStatus::Failed),
    )
    .await;
    let status = watchtree_test_utils::into_status(failed);
    assert_eq!(status.handler_label, "broken");
    assert!(!status.err.is_empty());
    assert_eq!(status.upstream_target_label, "up");
    assert_eq!(status.downstream, vec!["down".to_string()]);

    // Neither the second handler nor the downstream target may start.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while let Some(remaining) =
        deadline.checked_duration_since(tokio::time::Instant::now())
    {
        match tokio::time::timeout(remaining, status_rx.recv()).await {
            Ok(Some(StatusEvent::Status(s))) => {
                assert_ne!(s.handler_label, "never", "second handler ran after failure");
                assert_ne!(s.target_id, "down", "downstream ran after failure");
            }
            Ok(Some(StatusEvent::TargetPass(p))) => {
                panic!("unexpected pass for [{}]", p.target_id)
            }
            Ok(Some(StatusEvent::TreePass(_))) => panic!("unexpected tree pass"),
            Ok(None) | Err(_) => break,
        }
    }

    dispatcher.stop();
}

#[tokio::test]
async fn upstream_activity_cancels_downstream_run() {
    init_tracing();
    let proj = ProjectDir::new();
    proj.touch("package.json");
    let go_file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("deps")
                .root(proj.root())
                .include("package.json")
                .handler("install", &["true"])
                .build(),
        )
        .target(
            TargetBuilder::new("build")
                .root(proj.root())
                .include("**/*.go")
                .upstream("deps")
                .handler("compile", &["sleep 30"])
                .build(),
        )
        .resolve();
    let deps = cfg.target_by_id("deps").unwrap();
    let build = cfg.target_by_id("build").unwrap();

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    let requests = dispatcher.requests();

    // Start the slow downstream on its own trigger.
    requests.send(watcher_request(build, &go_file)).await.unwrap();
    wait_for_event(
        &mut status_rx,
        Duration::from_secs(5),
        status_is("build", TargetStatus::Started),
    )
    .await;

    // Upstream activity: its tree contains the downstream, so the running
    // compile is stale.
    requests
        .send(watcher_request(deps, &proj.root().join("package.json")))
        .await
        .unwrap();

    let canceled = wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("build", TargetStatus::Canceled),
    )
    .await;
    assert_eq!(
        watchtree_test_utils::into_status(canceled).err,
        "context canceled"
    );

    dispatcher.stop();
}

#[tokio::test]
async fn timeout_cancels_exec() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("slow")
                .root(proj.root())
                .include("**/*.go")
                .handler("wait", &["sleep 30"])
                .timeout("200ms")
                .build(),
        )
        .resolve();
    let target = &cfg.targets[0];

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    let started = tokio::time::Instant::now();
    dispatcher
        .requests()
        .send(watcher_request(target, &file))
        .await
        .unwrap();

    let canceled = wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("slow", TargetStatus::Canceled),
    )
    .await;
    let status = watchtree_test_utils::into_status(canceled);
    assert_eq!(status.err, "context deadline exceeded");
    // Dequeue tick + timeout + SIGTERM, far from the 30s sleep.
    assert!(started.elapsed() < Duration::from_secs(6));

    dispatcher.stop();
}

#[tokio::test]
async fn tree_runs_in_order_and_reports_passes() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("main.go");

    let cfg = ConfigBuilder::new()
        .cooldown("10ms")
        .target(
            TargetBuilder::new("a")
                .root(proj.root())
                .include("**/*.go")
                .handler("first", &["true"])
                .build(),
        )
        .target(
            TargetBuilder::new("b")
                .root(proj.root())
                .upstream("a")
                .handler("second", &["true"])
                .build(),
        )
        .resolve();
    let target = cfg.target_by_id("a").unwrap();

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    dispatcher
        .requests()
        .send(watcher_request(target, &file))
        .await
        .unwrap();

    let mut order = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while order.last() != Some(&"tree-pass".to_string()) {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out before tree pass");
        match tokio::time::timeout(remaining, status_rx.recv()).await {
            Ok(Some(StatusEvent::Status(s))) if s.cause == Some(TargetStatus::Started) => {
                order.push(format!("start:{}", s.target_id));
            }
            Ok(Some(StatusEvent::TargetPass(p))) => order.push(format!("pass:{}", p.target_id)),
            Ok(Some(StatusEvent::TreePass(p))) => {
                assert_eq!(p.dispatch_target_id, "a");
                order.push("tree-pass".to_string());
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => panic!("status stream ended early"),
        }
    }

    assert_eq!(
        order,
        vec!["start:a", "pass:a", "start:b", "pass:b", "tree-pass"]
    );
    dispatcher.stop();
}

#[tokio::test]
async fn command_template_variables_expand_at_run_time() {
    init_tracing();
    let proj = ProjectDir::new();
    let file = proj.touch("src/main.go");

    let cfg = ConfigBuilder::new()
        .target(
            TargetBuilder::new("app")
                .root(proj.root())
                .include("**/*.go")
                .handler(
                    "show",
                    &["sh -c 'echo label={{.TargetLabel}} handler={{.HandlerLabel}} path={{.Path}} dir={{.Dir}} glob={{.IncludeGlob}}; exit 1'"],
                )
                .build(),
        )
        .resolve();
    let target = &cfg.targets[0];

    let (dispatcher, mut status_rx, _panic_rx) = start_dispatcher();
    dispatcher
        .requests()
        .send(watcher_request(target, &file))
        .await
        .unwrap();

    // The deliberate exit 1 surfaces the expanded output in the status.
    let failed = wait_for_event(
        &mut status_rx,
        Duration::from_secs(10),
        status_is("app", TargetStatus::Failed),
    )
    .await;
    let status = watchtree_test_utils::into_status(failed);

    let src_dir = proj.root().join("src");
    assert!(status.stdout.contains("label=app"));
    assert!(status.stdout.contains("handler=show"));
    assert!(status
        .stdout
        .contains(&format!("path={}", file.display())));
    assert!(status.stdout.contains(&format!("dir={}", src_dir.display())));
    assert!(status
        .stdout
        .contains(&format!("glob={}/**/*.go", proj.root().display())));
    assert!(status.cmd.contains(&format!("path={}", file.display())));

    dispatcher.stop();
}
