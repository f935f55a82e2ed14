//! Shared runtime types: filesystem events, execution requests, target
//! statuses, and the persisted session shape.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::glob::Glob;
use crate::target::TargetNode;

/// Version stamp written into every encoded session file to support
/// compatibility checks at load time.
pub const SESSION_VERSION: u32 = 1;

/// Adapter-level debounce that suppresses duplicate events delivered when
/// both a file and its parent directory are watched. Must stay below any
/// user-configured target debounce.
pub const PRE_DEBOUNCE: Duration = Duration::from_millis(500);

/// How often the dispatcher drains one settled request from its queue.
pub const EXEC_REQUEST_QUEUE_TICK: Duration = Duration::from_secs(1);

/// Filesystem operation kinds after adapter normalization.
///
/// Multi-bit masks from the OS notifier collapse to a single op in the
/// priority order `Remove > Rename > Create > Write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Write,
    Rename,
    Remove,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Op::Create => "Create",
            Op::Write => "Write",
            Op::Rename => "Rename",
            Op::Remove => "Remove",
        };
        f.write_str(s)
    }
}

/// A normalized filesystem event delivered to per-target filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub op: Op,
}

/// A request to run a target and its downstream tree.
///
/// Produced by watchers on file activity, by the `run` subcommand, by
/// auto-start configuration, and by session resume. All fields are owned
/// copies so requests never alias dispatcher or watcher state.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Free-form origin marker: "watcher", "start", "resume", or "run".
    pub cause: String,

    /// How long to wait for file activity to settle before running.
    pub debounce: Duration,

    /// The filesystem activity that led to the request.
    pub event: FsEvent,

    /// The include pattern responsible for capturing the activity.
    pub include: Glob,

    /// When the dispatcher received the request. Stamped by ingress.
    pub recv_time: SystemTime,

    /// The triggered target followed by all downstream targets in DFS
    /// pre-order, snapshotted at startup.
    pub tree: Vec<TargetNode>,

    pub target_id: String,
    pub target_label: String,
}

impl ExecRequest {
    /// A request with no filesystem origin (run/start/resume causes).
    pub fn synthetic(cause: &str, id: &str, label: &str, tree: Vec<TargetNode>) -> Self {
        ExecRequest {
            cause: cause.to_string(),
            debounce: Duration::ZERO,
            event: FsEvent {
                path: PathBuf::new(),
                op: Op::Write,
            },
            include: Glob::default(),
            recv_time: SystemTime::now(),
            tree,
            target_id: id.to_string(),
            target_label: label.to_string(),
        }
    }
}

/// Why a target currently occupies a slot in the status list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    /// Activity settled and the target is queued to run.
    Pending,
    /// The dispatcher started running the target's commands.
    Started,
    /// Restored from a prior session and scheduled to run again.
    Resumed,
    /// A command exited non-zero or failed to start.
    Failed,
    /// The run was invalidated by new activity or shutdown.
    Canceled,
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TargetStatus::Pending => "pending",
            TargetStatus::Started => "started",
            TargetStatus::Resumed => "resumed",
            TargetStatus::Failed => "failed",
            TargetStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// One user-visible record describing a target's current or most recent
/// state. At most one `Status` per target id is retained at any time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub cause: Option<TargetStatus>,

    /// Final command string after template expansion.
    pub cmd: String,

    pub stdout: String,
    pub stderr: String,

    /// Non-empty if the command failed or was canceled.
    pub err: String,

    /// Process ids of the pipeline stages.
    pub pids: Vec<i32>,

    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,

    /// How long the command ran.
    pub run_len: Option<Duration>,

    /// The include responsible for capturing the triggering activity.
    pub include: Glob,

    pub target_id: String,
    pub target_label: String,
    pub handler_label: String,

    /// Label of the target whose activity started the tree run. Equals
    /// `target_label` when the target triggered itself.
    pub upstream_target_label: String,

    /// Labels of all downstream targets included in the run.
    pub downstream: Vec<String>,

    /// Filesystem operation kind that triggered the run.
    pub op: String,

    /// Path whose activity triggered the run.
    pub path: PathBuf,
}

/// A target whose commands all finished successfully.
#[derive(Debug, Clone)]
pub struct TargetPass {
    pub target_id: String,
    pub run_len: Duration,
}

/// A whole tree (triggered target plus downstream targets) that finished
/// successfully.
#[derive(Debug, Clone)]
pub struct TreePass {
    /// The first target in the tree, whose activity led to the run.
    pub dispatch_target_id: String,
}

/// Messages on the status bus. Producers use non-blocking sends and drop
/// events when the consumer is absent or slow.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    Status(Status),
    TargetPass(TargetPass),
    TreePass(TreePass),
}

/// Persisted snapshot of the status list, written on every change so that
/// in-flight and failed targets survive restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub version: u32,
    pub statuses: Vec<Status>,
}

impl Session {
    pub fn new(statuses: Vec<Status>) -> Self {
        Session {
            version: SESSION_VERSION,
            statuses,
        }
    }
}
