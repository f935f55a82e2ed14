//! Per-target event filtering.
//!
//! Each target with include patterns gets one filter task that owns the
//! mapping from watched path to the include glob responsible for it. The
//! filter decides whether an event should trigger the target, auto-watches
//! directories created under watched ones, and emits [`ExecRequest`]s to
//! the dispatcher.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::glob::Glob;
use crate::target::Target;
use crate::types::{ExecRequest, FsEvent, Op};
use crate::watch::FsWatcher;

/// Filter for a single target's file activity.
pub struct TargetWatcher {
    target: Target,
    watcher: FsWatcher,

    /// Watched path -> the include glob that caused it to be watched.
    include: HashMap<PathBuf, Glob>,

    exec_tx: mpsc::Sender<ExecRequest>,

    /// Reports auto-added directories; used by tests to synchronize.
    added_tx: Option<mpsc::Sender<PathBuf>>,
}

impl TargetWatcher {
    pub fn new(
        target: Target,
        include: HashMap<PathBuf, Glob>,
        watcher: FsWatcher,
        exec_tx: mpsc::Sender<ExecRequest>,
    ) -> Self {
        TargetWatcher {
            target,
            watcher,
            include,
            exec_tx,
            added_tx: None,
        }
    }

    /// Register a channel that reports every auto-watched directory.
    pub fn with_added_paths(mut self, tx: mpsc::Sender<PathBuf>) -> Self {
        self.added_tx = Some(tx);
        self
    }

    /// Consume normalized events until the stream closes.
    pub fn spawn(mut self, mut events: mpsc::Receiver<FsEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_event(event).await;
            }
            debug!(target = %self.target.label, "event stream closed; filter exiting");
        })
    }

    async fn handle_event(&mut self, event: FsEvent) {
        // Renames cannot be correlated with the paths they produce and
        // removals need no bookkeeping; neither drives executions.
        if event.op != Op::Create && event.op != Op::Write {
            return;
        }

        // Assume quickly-deleted paths are gone for good.
        let Ok(meta) = tokio::fs::metadata(&event.path).await else {
            return;
        };

        let matched = match self.target.match_path(&event.path) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    target = %self.target.label,
                    path = %event.path.display(),
                    error = %e,
                    "pattern match failed; event dropped"
                );
                return;
            }
        };

        let mut send_exec_req = false;
        let mut add_path = false;
        let mut include: Option<Glob> = None;

        match event.op {
            Op::Create => {
                let Some(parent) = event.path.parent() else {
                    return;
                };
                // The parent's glob is responsible for anything born inside
                // the directory it watches.
                let Some(parent_glob) = self.include.get(parent).cloned() else {
                    return;
                };

                if meta.is_dir() {
                    // Always watch new directories unless explicitly
                    // excluded: files matching a file-centric glob like
                    // `**/*.rs` may appear inside at any depth.
                    if matched.matched || matched.exclude.is_none() {
                        match self.watcher.add_path(&event.path).await {
                            Ok(()) => {
                                self.include
                                    .insert(event.path.clone(), parent_glob.clone());
                                add_path = true;
                                if let Some(tx) = &self.added_tx {
                                    let _ = tx.try_send(event.path.clone());
                                }
                            }
                            Err(e) => warn!(
                                target = %self.target.label,
                                path = %event.path.display(),
                                error = %e,
                                "failed to watch new directory"
                            ),
                        }
                    }
                    // An empty new directory cannot be a match target yet.
                    send_exec_req = false;
                } else {
                    // The parent directory watch already captures writes to
                    // the new file; just record which include is
                    // responsible so later writes can report it.
                    self.include
                        .insert(event.path.clone(), parent_glob.clone());
                    send_exec_req = matched.matched;
                }
                include = Some(parent_glob);
            }
            Op::Write => match self.include.get(&event.path).cloned() {
                Some(glob) => {
                    send_exec_req = matched.matched;
                    include = Some(glob);
                }
                None => {
                    info!(
                        target = %self.target.label,
                        path = %event.path.display(),
                        "no include recorded for path; write event skipped"
                    );
                    return;
                }
            },
            Op::Rename | Op::Remove => unreachable!("filtered above"),
        }

        let include = include.unwrap_or_default();

        debug!(
            target = %self.target.label,
            op = %event.op,
            path = %event.path.display(),
            include = %include.pattern,
            add_path,
            send_exec_req,
            "watcher event"
        );

        if send_exec_req {
            let req = ExecRequest {
                cause: "watcher".to_string(),
                debounce: self.target.debounce,
                event,
                include,
                recv_time: crate::clock::now(),
                // Owned copies only, so the dispatcher never aliases
                // watcher state.
                tree: self.target.tree.clone(),
                target_id: self.target.id.clone(),
                target_label: self.target.label.clone(),
            };
            if self.exec_tx.send(req).await.is_err() {
                warn!(target = %self.target.label, "dispatcher gone; dropping request");
            }
        }
    }
}
