//! watchtree: a file-activity-driven command runner.
//!
//! Watches configured paths, waits for writes to settle, then runs each
//! triggered target's handlers followed by its downstream targets, with
//! cancellation on new activity and a persisted session for resume across
//! restarts.

pub mod cli;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod errors;
pub mod exec;
pub mod glob;
pub mod logging;
pub mod session;
pub mod target;
pub mod template;
pub mod types;
pub mod watch;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::cli::{Cli, Command};
use crate::config::ResolvedConfig;
use crate::dispatch::Dispatcher;
use crate::errors::Result;
use crate::exec::SIG_KILL_DELAY;
use crate::session::{SessionStore, StatusBoard};
use crate::target::Target;
use crate::types::{ExecRequest, Status, StatusEvent, TargetStatus, PRE_DEBOUNCE};
use crate::watch::{FsWatcher, TargetWatcher};

/// A started engine: dispatcher, per-target watchers, and the channels the
/// embedding mode consumes.
pub struct Engine {
    pub dispatcher: Dispatcher,

    /// Status bus receiver; exactly one consumer (board or `run` loop).
    pub status_rx: mpsc::Receiver<StatusEvent>,

    /// Internal panics from watcher filters and target runs.
    pub panic_rx: mpsc::Receiver<String>,

    watchers: Vec<FsWatcher>,
}

impl Engine {
    /// Stop the dispatcher (cancelling any in-flight tree) and close all
    /// filesystem watchers.
    pub fn stop(&self) {
        self.dispatcher.stop();
        for watcher in &self.watchers {
            watcher.close();
        }
    }
}

/// Build and start the engine: one watcher + filter per target with
/// include patterns, the dispatcher, and the auto-start requests.
pub async fn start_engine(cfg: &ResolvedConfig) -> Result<Engine> {
    let (status_tx, status_rx) = mpsc::channel::<StatusEvent>(64);
    let (panic_tx, panic_rx) = mpsc::channel::<String>(8);

    let dispatcher = Dispatcher::start(cfg.cooldown, status_tx, panic_tx.clone());

    let mut watchers = Vec::new();
    for target in &cfg.targets {
        if target.include.is_empty() {
            // Targets without includes only run via the `run` subcommand or
            // auto-start.
            info!(target = %target.label, "no includes, skipped watcher creation");
            continue;
        }

        let include = watch_set(target)?;
        let watcher = FsWatcher::spawn()?;
        watcher.set_debounce(PRE_DEBOUNCE);
        let events = watcher.subscribe();

        for path in include.keys() {
            watcher.add_path(path.clone()).await?;
            info!(target = %target.label, path = %path.display(), "added watch");
        }

        let filter = TargetWatcher::new(
            target.clone(),
            include,
            watcher.clone(),
            dispatcher.requests(),
        );
        let handle = filter.spawn(events);

        // Surface filter panics for a graceful shutdown instead of a
        // silently dead watcher.
        let monitor_tx = panic_tx.clone();
        let label = target.label.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    let _ = monitor_tx.try_send(format!("panic in watcher for [{label}]"));
                }
            }
        });

        watchers.push(watcher);
    }

    for &idx in &cfg.auto_start {
        let target = &cfg.targets[idx];
        let _ = dispatcher
            .requests()
            .send(ExecRequest::synthetic(
                "start",
                &target.id,
                &target.label,
                target.tree.clone(),
            ))
            .await;
    }

    Ok(Engine {
        dispatcher,
        status_rx,
        panic_rx,
        watchers,
    })
}

/// Expand a target's globs into the initial path -> include watch set.
fn watch_set(target: &Target) -> Result<HashMap<PathBuf, glob::Glob>> {
    let results = glob::expand(&target.include, &target.exclude)
        .map_err(|e| errors::WatchtreeError::Watch(format!("target [{}]: {e}", target.label)))?;
    Ok(glob::combine(&results).into_iter().collect())
}

/// Dispatch a parsed command line. Returns the process exit code.
pub async fn run(args: Cli) -> Result<i32> {
    match args.command {
        None => root_command(&args.config).await,
        Some(Command::Eval { subject }) => eval_command(&args.config, &subject),
        Some(Command::Run { target_id }) => run_command(&args.config, &target_id).await,
    }
}

/// Root mode: watch, run, persist the session, until interrupted.
async fn root_command(config_path: &str) -> Result<i32> {
    let cfg = config::load_and_resolve(config_path)?;

    // Seed the status list from the prior session and schedule resumes for
    // targets that were interrupted mid-run.
    let store = cfg.session_file.as_ref().map(SessionStore::new);
    let (seed, resume_requests) = match &store {
        Some(store) => match store.load()? {
            Some(prior) => session::resume_session(prior, &cfg.targets),
            None => (Vec::new(), Vec::new()),
        },
        None => (Vec::new(), Vec::new()),
    };
    if !seed.is_empty() {
        let labels: Vec<&str> = seed.iter().map(|s| s.target_label.as_str()).collect();
        info!(targets = ?labels, "resuming session");
    }

    let mut engine = start_engine(&cfg).await?;

    let status_rx = std::mem::replace(&mut engine.status_rx, mpsc::channel(1).1);
    let board = StatusBoard::new(seed, store);
    tokio::spawn(board.run(status_rx));

    for req in resume_requests {
        let _ = engine.dispatcher.requests().send(req).await;
    }

    let code = wait_for_shutdown(&mut engine).await;

    engine.stop();
    info!(
        "waiting {}s for processes to shut down",
        SIG_KILL_DELAY.as_secs()
    );
    tokio::time::sleep(SIG_KILL_DELAY).await;
    Ok(code)
}

/// Block until a termination signal or an internal panic.
async fn wait_for_shutdown(engine: &mut Engine) -> i32 {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                0
            }
            _ = sigterm.recv() => {
                info!("termination signal received");
                0
            }
            msg = engine.panic_rx.recv() => {
                if let Some(msg) = msg {
                    error!("{msg}");
                }
                1
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => 0,
            msg = engine.panic_rx.recv() => {
                if let Some(msg) = msg {
                    error!("{msg}");
                }
                1
            }
        }
    }
}

/// Find the first target whose expanded include set contains `subject`.
/// Returns the target label, the responsible pattern, and the tree labels.
pub fn eval_path(
    cfg: &ResolvedConfig,
    subject: &Path,
) -> Result<Option<(String, String, Vec<String>)>> {
    for target in &cfg.targets {
        let results = glob::expand(&target.include, &target.exclude)?;
        let includes = glob::combine(&results);
        if includes.is_empty() {
            continue;
        }

        if let Some(include) = includes.get(subject) {
            let tree = target.tree.iter().map(|n| n.label.clone()).collect();
            return Ok(Some((
                target.label.clone(),
                include.pattern.clone(),
                tree,
            )));
        }
    }
    Ok(None)
}

/// Print the first target whose include set covers the subject path.
fn eval_command(config_path: &str, subject: &str) -> Result<i32> {
    let cfg = config::load_and_resolve(config_path)?;
    let subject = absolutize(Path::new(subject))?;

    match eval_path(&cfg, &subject)? {
        Some((label, pattern, tree)) => {
            println!("Matched with target [{label}] glob [{pattern}]\nTree:");
            for node_label in tree {
                println!("\t- [{node_label}]");
            }
        }
        None => println!("Target match not found"),
    }
    Ok(0)
}

/// Terminal result of a headless single-target run.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every target in the dispatched tree ran to completion.
    Passed,
    /// A command in the dispatched tree failed or was canceled.
    Failed(Status),
}

/// Consume the status stream until the dispatched tree for `target` either
/// passes or one of its members fails.
///
/// Events for targets outside the tree are ignored, so a concurrent run of
/// an unrelated target cannot end the wait with the wrong verdict. Returns
/// `None` if the stream closes without a terminal event.
pub async fn await_run_outcome(
    status_rx: &mut mpsc::Receiver<StatusEvent>,
    target: &Target,
) -> Option<RunOutcome> {
    let tree_ids: HashSet<&str> = target.tree.iter().map(|n| n.id.as_str()).collect();

    while let Some(event) = status_rx.recv().await {
        match event {
            StatusEvent::TreePass(pass) if pass.dispatch_target_id == target.id => {
                return Some(RunOutcome::Passed);
            }
            StatusEvent::Status(status)
                if matches!(
                    status.cause,
                    Some(TargetStatus::Failed) | Some(TargetStatus::Canceled)
                ) && tree_ids.contains(status.target_id.as_str()) =>
            {
                return Some(RunOutcome::Failed(status));
            }
            _ => {}
        }
    }
    None
}

/// Run a single target headlessly: exit 0 on tree success, 1 on failure.
///
/// Unlike the root mode this wires no file watchers and no auto-start
/// requests; the dispatcher's only request source is the one submitted
/// here.
async fn run_command(config_path: &str, target_id: &str) -> Result<i32> {
    let cfg = config::load_and_resolve(config_path)?;

    let Some(target) = cfg.target_by_id(target_id) else {
        eprintln!("Target with id [{target_id}] not found");
        return Ok(1);
    };

    let (status_tx, mut status_rx) = mpsc::channel::<StatusEvent>(64);
    let (panic_tx, mut panic_rx) = mpsc::channel::<String>(8);
    let dispatcher = Dispatcher::start(cfg.cooldown, status_tx, panic_tx);

    dispatcher
        .requests()
        .send(ExecRequest::synthetic(
            "run",
            &target.id,
            &target.label,
            target.tree.clone(),
        ))
        .await
        .ok();

    // Wait on the status stream and termination signals rather than
    // blocking forever.
    tokio::select! {
        outcome = await_run_outcome(&mut status_rx, target) => {
            dispatcher.stop();
            match outcome {
                Some(RunOutcome::Passed) => Ok(0),
                Some(RunOutcome::Failed(status)) => {
                    eprintln!("run failed on command:\n{}", status.cmd);
                    if !status.stdout.is_empty() {
                        eprintln!("\nlast stdout:\n{}", status.stdout);
                    }
                    if !status.stderr.is_empty() {
                        eprintln!("\nlast stderr:\n{}", status.stderr);
                    }
                    Ok(1)
                }
                None => Ok(1),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            dispatcher.stop();
            info!(
                "waiting {}s for processes to shut down",
                SIG_KILL_DELAY.as_secs()
            );
            tokio::time::sleep(SIG_KILL_DELAY).await;
            Ok(0)
        }
        msg = panic_rx.recv() => {
            if let Some(msg) = msg {
                error!("{msg}");
            }
            dispatcher.stop();
            Ok(1)
        }
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
