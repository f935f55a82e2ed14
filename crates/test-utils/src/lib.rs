//! Shared builders and helpers for watchtree tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;

use tempfile::TempDir;

use watchtree::config::model::{RawConfig, RawExec, RawGlob, RawHandler, RawTarget};
use watchtree::config::resolve::{resolve, ResolvedConfig};
use watchtree::target::Target;
use watchtree::types::{ExecRequest, FsEvent, Op, Status, StatusEvent, TargetStatus};

static INIT: Once = Once::new();

/// Initialise tracing once for the whole test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// A temporary project directory with helpers for creating files.
pub struct ProjectDir {
    _dir: TempDir,
    root: PathBuf,
}

impl ProjectDir {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create tempdir");
        let root = dir.path().canonicalize().expect("canonicalize tempdir");
        ProjectDir { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mkdir(&self, rel: &str) -> PathBuf {
        let path = self.root.join(rel);
        std::fs::create_dir_all(&path).expect("create dir");
        path
    }

    pub fn write(&self, rel: &str, contents: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dirs");
        }
        std::fs::write(&path, contents).expect("write file");
        path
    }

    pub fn touch(&self, rel: &str) -> PathBuf {
        self.write(rel, "")
    }
}

impl Default for ProjectDir {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `RawTarget` to simplify test setup.
pub struct TargetBuilder {
    target: RawTarget,
}

impl TargetBuilder {
    pub fn new(label: &str) -> Self {
        TargetBuilder {
            target: RawTarget {
                label: label.to_string(),
                id: Some(label.to_string()),
                root: None,
                debounce: Some("0s".to_string()),
                include: Vec::new(),
                exclude: Vec::new(),
                upstream: Vec::new(),
                handlers: Vec::new(),
            },
        }
    }

    pub fn root(mut self, root: &Path) -> Self {
        self.target.root = Some(root.display().to_string());
        self
    }

    pub fn debounce(mut self, value: &str) -> Self {
        self.target.debounce = Some(value.to_string());
        self
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.target.include.push(RawGlob {
            pattern: pattern.to_string(),
            root: None,
        });
        self
    }

    pub fn exclude(mut self, pattern: &str) -> Self {
        self.target.exclude.push(RawGlob {
            pattern: pattern.to_string(),
            root: None,
        });
        self
    }

    pub fn upstream(mut self, id: &str) -> Self {
        self.target.upstream.push(id.to_string());
        self
    }

    /// Append a handler with one exec per command string.
    pub fn handler(mut self, label: &str, cmds: &[&str]) -> Self {
        self.target.handlers.push(RawHandler {
            label: label.to_string(),
            execs: cmds
                .iter()
                .map(|cmd| RawExec {
                    cmd: cmd.to_string(),
                    dir: None,
                    timeout: None,
                    env: Vec::new(),
                })
                .collect(),
        });
        self
    }

    /// Set the timeout of the most recently added exec.
    pub fn timeout(mut self, value: &str) -> Self {
        let exec = self
            .target
            .handlers
            .last_mut()
            .and_then(|h| h.execs.last_mut())
            .expect("timeout() requires a handler with an exec");
        exec.timeout = Some(value.to_string());
        self
    }

    pub fn build(self) -> RawTarget {
        self.target
    }
}

/// Builder for `RawConfig`.
pub struct ConfigBuilder {
    config: RawConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        ConfigBuilder {
            config: RawConfig::default(),
        }
    }

    pub fn cooldown(mut self, value: &str) -> Self {
        self.config.global.cooldown = Some(value.to_string());
        self
    }

    pub fn session_file(mut self, path: &Path) -> Self {
        self.config.data.session.file = Some(path.display().to_string());
        self
    }

    pub fn global_exclude(mut self, pattern: &str) -> Self {
        self.config.global.exclude.push(RawGlob {
            pattern: pattern.to_string(),
            root: None,
        });
        self
    }

    pub fn template(mut self, key: &str, value: &str) -> Self {
        self.config
            .template
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn auto_start(mut self, id: &str) -> Self {
        self.config.auto_start_target.push(id.to_string());
        self
    }

    pub fn target(mut self, target: RawTarget) -> Self {
        self.config.target.push(target);
        self
    }

    pub fn build(self) -> RawConfig {
        self.config
    }

    pub fn resolve(self) -> ResolvedConfig {
        resolve(self.config).expect("failed to resolve config from builder")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The request a watcher filter would emit for write activity on `path`.
pub fn watcher_request(target: &Target, path: &Path) -> ExecRequest {
    ExecRequest {
        cause: "watcher".to_string(),
        debounce: target.debounce,
        event: FsEvent {
            path: path.to_path_buf(),
            op: Op::Write,
        },
        include: target.include.first().cloned().unwrap_or_default(),
        recv_time: std::time::SystemTime::now(),
        tree: target.tree.clone(),
        target_id: target.id.clone(),
        target_label: target.label.clone(),
    }
}

/// Receive status events until `pred` matches one, or panic after
/// `timeout`. Returns the matching event.
pub async fn wait_for_event(
    rx: &mut tokio::sync::mpsc::Receiver<StatusEvent>,
    timeout: Duration,
    mut pred: impl FnMut(&StatusEvent) -> bool,
) -> StatusEvent {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for status event"));
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => {
                if pred(&event) {
                    return event;
                }
            }
            Ok(None) => panic!("status stream closed while waiting"),
            Err(_) => panic!("timed out waiting for status event"),
        }
    }
}

/// Shorthand predicate: a `Status` for `target_id` with the given cause.
pub fn status_is(target_id: &str, cause: TargetStatus) -> impl FnMut(&StatusEvent) -> bool + '_ {
    move |event| match event {
        StatusEvent::Status(status) => {
            status.target_id == target_id && status.cause == Some(cause)
        }
        _ => false,
    }
}

/// Extract the `Status` payload, panicking on other variants.
pub fn into_status(event: StatusEvent) -> Status {
    match event {
        StatusEvent::Status(status) => status,
        other => panic!("expected a status event, got {other:?}"),
    }
}
