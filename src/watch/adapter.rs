//! Thin actor around the OS file notifier.
//!
//! Normalizes raw `notify` events to the four [`Op`] kinds, drops
//! metadata-only noise, and pre-debounces duplicates that arrive when both
//! a file and its parent directory are watched. Watches are always
//! non-recursive; the per-target filter decides which directories join the
//! watch set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{Result, WatchtreeError};
use crate::types::{FsEvent, Op};

enum Command {
    AddPath(PathBuf, oneshot::Sender<Result<()>>),
    RemovePath(PathBuf, oneshot::Sender<Result<()>>),
    Subscribe(mpsc::Sender<FsEvent>),
    SetDebounce(Duration),
    Close,
}

/// Handle to a watcher actor. Cheap to clone.
#[derive(Clone)]
pub struct FsWatcher {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher").finish()
    }
}

impl FsWatcher {
    /// Create the OS watcher and spawn the actor task that owns it.
    pub fn spawn() -> Result<FsWatcher> {
        // Channel from the blocking notify callback into the async world.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Event>();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(err) => {
                    // Per-event errors are non-fatal; registration errors
                    // surface through add_path instead.
                    warn!(error = %err, "file watch error");
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| WatchtreeError::Watch(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(actor(watcher, raw_rx, cmd_rx));

        Ok(FsWatcher { cmd_tx })
    }

    /// Watch a file or directory, non-recursively.
    pub async fn add_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::AddPath(path.into(), tx))
            .map_err(|_| WatchtreeError::Watch("watcher actor is gone".to_string()))?;
        rx.await
            .map_err(|_| WatchtreeError::Watch("watcher actor is gone".to_string()))?
    }

    pub async fn remove_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RemovePath(path.into(), tx))
            .map_err(|_| WatchtreeError::Watch("watcher actor is gone".to_string()))?;
        rx.await
            .map_err(|_| WatchtreeError::Watch("watcher actor is gone".to_string()))?
    }

    /// Register a subscriber; returns the stream of normalized events.
    pub fn subscribe(&self) -> mpsc::Receiver<FsEvent> {
        let (tx, rx) = mpsc::channel(256);
        let _ = self.cmd_tx.send(Command::Subscribe(tx));
        rx
    }

    /// Enable adapter-level pre-debouncing of duplicate events.
    pub fn set_debounce(&self, interval: Duration) {
        let _ = self.cmd_tx.send(Command::SetDebounce(interval));
    }

    /// Stop monitoring and drop all subscribers.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close);
    }
}

async fn actor(
    mut watcher: RecommendedWatcher,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Event>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut subscribers: Vec<mpsc::Sender<FsEvent>> = Vec::new();
    let mut debounce = Duration::ZERO;
    // Trailing-edge dedupe keyed by (op, path).
    let mut pending: HashMap<(Op, PathBuf), (FsEvent, Instant)> = HashMap::new();

    loop {
        let next_deadline = pending.values().map(|(_, d)| *d).min();

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::AddPath(path, reply)) => {
                    let res = watcher
                        .watch(&path, RecursiveMode::NonRecursive)
                        .map_err(|e| {
                            WatchtreeError::Watch(format!(
                                "failed to watch [{}]: {e}",
                                path.display()
                            ))
                        });
                    let _ = reply.send(res);
                }
                Some(Command::RemovePath(path, reply)) => {
                    let res = watcher.unwatch(&path).map_err(|e| {
                        WatchtreeError::Watch(format!(
                            "failed to unwatch [{}]: {e}",
                            path.display()
                        ))
                    });
                    let _ = reply.send(res);
                }
                Some(Command::Subscribe(tx)) => subscribers.push(tx),
                Some(Command::SetDebounce(interval)) => debounce = interval,
                Some(Command::Close) | None => break,
            },

            maybe = raw_rx.recv() => {
                let Some(raw) = maybe else { break };
                let Some(op) = normalize_kind(&raw.kind) else { continue };

                for path in raw.paths {
                    // Empty paths appear as shutdown artifacts on some
                    // platforms.
                    if path.as_os_str().is_empty() {
                        continue;
                    }
                    let event = FsEvent { path: path.clone(), op };

                    if debounce > Duration::ZERO {
                        let deadline = Instant::now() + debounce;
                        pending.insert((op, path), (event, deadline));
                    } else {
                        broadcast(&mut subscribers, event).await;
                    }
                }
            }

            _ = sleep_until_maybe(next_deadline), if next_deadline.is_some() => {
                let now = Instant::now();
                let expired: Vec<(Op, PathBuf)> = pending
                    .iter()
                    .filter(|(_, (_, deadline))| *deadline <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    if let Some((event, _)) = pending.remove(&key) {
                        broadcast(&mut subscribers, event).await;
                    }
                }
            }
        }
    }

    debug!("watcher actor exiting");
}

async fn sleep_until_maybe(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn broadcast(subscribers: &mut Vec<mpsc::Sender<FsEvent>>, event: FsEvent) {
    let mut closed = Vec::new();
    for (i, sub) in subscribers.iter().enumerate() {
        if sub.send(event.clone()).await.is_err() {
            closed.push(i);
        }
    }
    for i in closed.into_iter().rev() {
        subscribers.swap_remove(i);
    }
}

/// Collapse the notifier's event kinds to a single op, priority
/// `Remove > Rename > Create > Write`. Metadata-only changes (chmod and
/// friends) and access events are dropped.
fn normalize_kind(kind: &EventKind) -> Option<Op> {
    match kind {
        EventKind::Remove(_) => Some(Op::Remove),
        EventKind::Modify(ModifyKind::Name(_)) => Some(Op::Rename),
        EventKind::Create(_) => Some(Op::Create),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(Op::Write),
        EventKind::Access(_) => None,
        // Coarse platforms only say "something changed".
        EventKind::Any => Some(Op::Write),
        EventKind::Other => None,
    }
}
