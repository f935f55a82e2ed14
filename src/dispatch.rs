//! The dispatcher: converts raw execution requests into serialized,
//! debounced, cancel-aware tree runs.
//!
//! Two persistent tasks cooperate. Ingress stamps incoming requests,
//! cancels any in-flight run their tree overlaps, replaces queued requests
//! for the same target, and debounces per (target, path). The runner
//! consumes a single-consumer channel and executes one tree at a time, so
//! runs never overlap while ingress stays free to cancel mid-exec.
//!
//! Queueing trade-off, kept deliberately: when an upstream request arrives
//! immediately before its downstream's own request, the downstream runs
//! twice, once inside the upstream's tree and once from its queued request,
//! which is not yet in `target_ctx` and therefore cannot be cancelled.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock;
use crate::debounce::{self, DebounceHandle};
use crate::exec::{self, ExecError};
use crate::template::{self, CmdVars};
use crate::types::{
    ExecRequest, Status, StatusEvent, TargetPass, TargetStatus, TreePass,
    EXEC_REQUEST_QUEUE_TICK,
};

/// Handle to a running dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    exec_req_tx: mpsc::Sender<ExecRequest>,
    done: CancellationToken,
    shared: Arc<Shared>,
}

struct Shared {
    /// Pause between successful commands.
    cooldown: Duration,

    /// Status bus; all sends are non-blocking and droppable.
    status_tx: mpsc::Sender<StatusEvent>,

    /// Internal panics and expansion failures, forwarded for a graceful
    /// engine shutdown.
    panic_tx: mpsc::Sender<String>,

    /// Cancel handles for currently-running trees, one entry per tree
    /// member. Written only by the runner; read and fired by ingress.
    target_ctx: DashMap<String, CancellationToken>,

    /// Requests whose debounce settled, awaiting a run slot.
    queue: Mutex<VecDeque<ExecRequest>>,
}

impl Shared {
    fn emit(&self, event: StatusEvent) {
        // Only deliver if there's a receiver with room; the consumer being
        // absent or slow must never stall a run.
        let _ = self.status_tx.try_send(event);
    }
}

impl Dispatcher {
    /// Spawn the ingress and runner tasks and return the handle.
    pub fn start(
        cooldown: Duration,
        status_tx: mpsc::Sender<StatusEvent>,
        panic_tx: mpsc::Sender<String>,
    ) -> Dispatcher {
        let (exec_req_tx, exec_req_rx) = mpsc::channel::<ExecRequest>(8);
        let (run_tx, run_rx) = mpsc::channel::<ExecRequest>(1);
        let done = CancellationToken::new();

        let shared = Arc::new(Shared {
            cooldown,
            status_tx,
            panic_tx,
            target_ctx: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
        });

        tokio::spawn(ingress(
            Arc::clone(&shared),
            done.clone(),
            exec_req_rx,
            run_tx,
        ));
        tokio::spawn(runner(Arc::clone(&shared), done.clone(), run_rx));

        Dispatcher {
            exec_req_tx,
            done,
            shared,
        }
    }

    /// Sender for execution requests (watchers, auto-start, resume, run).
    pub fn requests(&self) -> mpsc::Sender<ExecRequest> {
        self.exec_req_tx.clone()
    }

    /// Stop accepting requests and cancel any in-flight tree.
    pub fn stop(&self) {
        self.done.cancel();
        for entry in self.shared.target_ctx.iter() {
            info!(target_id = %entry.key(), "canceled target due to shutdown");
            entry.value().cancel();
        }
    }
}

async fn ingress(
    shared: Arc<Shared>,
    done: CancellationToken,
    mut exec_req_rx: mpsc::Receiver<ExecRequest>,
    run_tx: mpsc::Sender<ExecRequest>,
) {
    // Debounced enqueuers indexed by target id, then by activity path.
    // Per-path granularity lets distinct active paths of one target settle
    // independently instead of the first burst swallowing the rest.
    let mut debouncers: HashMap<String, HashMap<PathBuf, DebounceHandle<ExecRequest>>> =
        HashMap::new();
    let (settled_tx, mut settled_rx) = mpsc::channel::<ExecRequest>(64);

    let mut ticker = tokio::time::interval(EXEC_REQUEST_QUEUE_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = done.cancelled() => return,

            maybe = exec_req_rx.recv() => {
                let Some(mut req) = maybe else { return };
                req.recv_time = clock::now();
                info!(
                    target = %req.target_label,
                    path = %req.event.path.display(),
                    op = %req.event.op,
                    cause = %req.cause,
                    debounce = ?req.debounce,
                    "execution request"
                );

                // Any in-flight run of any tree member is stale now.
                for node in &req.tree {
                    match shared.target_ctx.get(&node.id) {
                        Some(ctx) => {
                            info!(
                                canceled_target = %node.label,
                                activated_target = %req.target_label,
                                "canceled target due to activity"
                            );
                            ctx.cancel();
                        }
                        None => debug!(
                            canceled_target = %node.label,
                            activated_target = %req.target_label,
                            "no context found for activity cancellation"
                        ),
                    }
                }

                // A newer request replaces any queued one for the same
                // target (e.g. a resume enqueued at startup).
                {
                    let mut queue = shared.queue.lock().unwrap();
                    let before = queue.len();
                    queue.retain(|queued| queued.target_id != req.target_id);
                    if queue.len() != before {
                        debug!(target = %req.target_label, "replaced queued request");
                    }
                }

                if req.debounce > Duration::ZERO {
                    let handle = debouncers
                        .entry(req.target_id.clone())
                        .or_default()
                        .entry(req.event.path.clone())
                        .or_insert_with(|| {
                            debounce::spawn(req.debounce, settled_tx.clone())
                        });
                    debug!(target = %req.target_label, "debounce reset");
                    handle.call(req);
                } else {
                    enqueue(&shared, req);
                }
            }

            maybe = settled_rx.recv() => {
                let Some(req) = maybe else { return };
                debug!(target = %req.target_label, "debounce settled");
                enqueue(&shared, req);
            }

            // Periodically hand one settled request to the runner. The
            // spawned send decouples queue draining from the runner being
            // mid-exec.
            _ = ticker.tick() => {
                let popped = shared.queue.lock().unwrap().pop_front();
                if let Some(req) = popped {
                    info!(target = %req.target_label, cause = %req.cause, "dequeue");
                    let run_tx = run_tx.clone();
                    tokio::spawn(async move {
                        let _ = run_tx.send(req).await;
                    });
                }
            }
        }
    }
}

/// Put a settled request on the run queue and surface the pending state.
fn enqueue(shared: &Shared, req: ExecRequest) {
    info!(target = %req.target_label, cause = %req.cause, "enqueue, set pending");
    shared.emit(StatusEvent::Status(Status {
        cause: Some(TargetStatus::Pending),
        target_id: req.target_id.clone(),
        target_label: req.target_label.clone(),
        ..Status::default()
    }));
    shared.queue.lock().unwrap().push_back(req);
}

/// Execute one tree at a time, in dequeue order.
async fn runner(
    shared: Arc<Shared>,
    done: CancellationToken,
    mut run_rx: mpsc::Receiver<ExecRequest>,
) {
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            maybe = run_rx.recv() => {
                let Some(req) = maybe else { return };
                // Run in a task of its own so a panic is contained and
                // forwarded instead of taking the engine down.
                let run_shared = Arc::clone(&shared);
                let handle = tokio::spawn(run_target(run_shared, req));
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        let _ = shared.panic_tx.try_send(format!("target run failed: {e:#}"));
                    }
                    Err(join_err) if join_err.is_panic() => {
                        let payload = join_err.into_panic();
                        let msg = payload
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        let _ = shared.panic_tx.try_send(format!("panic in target run: {msg}"));
                    }
                    Err(_) => {}
                }
            }
        }
    }
}

/// Run every handler of every tree member in order, stopping the whole
/// tree at the first problem.
async fn run_target(shared: Arc<Shared>, req: ExecRequest) -> anyhow::Result<()> {
    let tree_labels: Vec<&str> = req.tree.iter().map(|n| n.label.as_str()).collect();
    info!(
        cause = %req.cause,
        op = %req.event.op,
        path = %req.event.path.display(),
        target = %req.target_label,
        tree = ?tree_labels,
        "run tree"
    );

    // One cancel scope for the whole tree: activity on any member, at any
    // point of the run, invalidates everything still to come. Install every
    // member up front so ingress can find the handle even before that
    // member's own commands begin.
    let tree_token = CancellationToken::new();
    for node in &req.tree {
        shared
            .target_ctx
            .insert(node.id.clone(), tree_token.clone());
    }

    let result = run_tree(&shared, &req, &tree_token).await;

    for node in &req.tree {
        shared.target_ctx.remove(&node.id);
    }

    result
}

async fn run_tree(
    shared: &Shared,
    req: &ExecRequest,
    tree_token: &CancellationToken,
) -> anyhow::Result<()> {
    let downstream_labels: Vec<String> = req
        .tree
        .iter()
        .skip(1)
        .map(|n| n.label.clone())
        .collect();

    for node in &req.tree {
        let target_start = tokio::time::Instant::now();

        for handler in &node.handlers {
            for exec in &handler.execs {
                let vars =
                    CmdVars::from_parts(&req.event.path, &handler.label, &req.include, &node.label);
                let cmd_expanded = template::expand(&exec.cmd, &vars.into_map())
                    .map_err(|e| e.context(format!("expanding command for [{}]", node.label)))?;
                let stages = exec::parse_pipeline(&cmd_expanded)
                    .map_err(|e| e.context(format!("parsing command for [{}]", node.label)))?;

                info!(
                    target = %node.label,
                    dispatch_target = %req.target_label,
                    handler = %handler.label,
                    cmd = %cmd_expanded,
                    "starting handler command"
                );

                let cmd_start = clock::now();
                let started = tokio::time::Instant::now();
                shared.emit(StatusEvent::Status(Status {
                    cause: Some(TargetStatus::Started),
                    target_id: node.id.clone(),
                    target_label: node.label.clone(),
                    handler_label: handler.label.clone(),
                    path: req.event.path.clone(),
                    start_time: Some(cmd_start),
                    ..Status::default()
                }));

                let cmd_token = tree_token.child_token();
                let outcome = exec::run_pipeline(
                    &cmd_token,
                    exec.timeout,
                    &stages,
                    &exec.dir,
                    &exec.env,
                )
                .await;

                // A tree-level cancel that lands after the process exits
                // still invalidates the run; check it before trusting a
                // clean exit.
                let err = if tree_token.is_cancelled() {
                    Some(ExecError::Canceled)
                } else {
                    outcome.err
                };

                let pids: Vec<i32> = outcome.procs.iter().map(|p| p.pid).collect();
                let codes: Vec<i32> = outcome.procs.iter().map(|p| p.code).collect();
                info!(
                    target = %node.label,
                    handler = %handler.label,
                    cmd = %cmd_expanded,
                    ?pids,
                    ?codes,
                    run_len = ?started.elapsed(),
                    error = ?err,
                    "handler command finished"
                );

                if let Some(err) = err {
                    let cause = if err.is_cancellation() {
                        TargetStatus::Canceled
                    } else {
                        TargetStatus::Failed
                    };

                    shared.emit(StatusEvent::Status(Status {
                        cause: Some(cause),
                        cmd: cmd_expanded,
                        stdout: outcome.stdout,
                        stderr: outcome.stderr,
                        err: err.to_string(),
                        pids,
                        start_time: Some(cmd_start),
                        end_time: Some(clock::now()),
                        run_len: Some(started.elapsed()),
                        include: req.include.clone(),
                        target_id: node.id.clone(),
                        target_label: node.label.clone(),
                        handler_label: handler.label.clone(),
                        upstream_target_label: req.target_label.clone(),
                        op: req.event.op.to_string(),
                        path: req.event.path.clone(),
                        downstream: downstream_labels.clone(),
                    }));

                    // Only surface one problem per run; everything after
                    // this point in the tree is skipped.
                    return Ok(());
                }

                tokio::time::sleep(shared.cooldown).await;
            }
        }

        shared.emit(StatusEvent::TargetPass(TargetPass {
            target_id: node.id.clone(),
            run_len: target_start.elapsed(),
        }));
        // This member is done; its portion of the tree can be re-triggered
        // with a fresh scope next time.
        shared.target_ctx.remove(&node.id);
    }

    shared.emit(StatusEvent::TreePass(TreePass {
        dispatch_target_id: req.target_id.clone(),
    }));

    Ok(())
}
