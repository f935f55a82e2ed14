//! Session persistence and the status board.
//!
//! The session file is a compact binary snapshot of the status list,
//! rewritten atomically on every change so that pending/running targets can
//! be resumed and unresolved failures stay visible across restarts.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{Result, WatchtreeError};
use crate::target::Target;
use crate::types::{ExecRequest, Session, Status, StatusEvent, TargetStatus, SESSION_VERSION};

/// Create the session file and its intermediate directories eagerly so a
/// bad path fails at startup instead of on the first timer-driven write.
/// Directories are created 0700, the file 0600.
pub fn prepare_session_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder.create(parent)?;
        }
    }

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path).map_err(|e| {
        WatchtreeError::Session(format!(
            "failed to init session file [{}]: {e}",
            path.display()
        ))
    })?;

    Ok(())
}

/// Reads and writes the session file.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionStore { path: path.into() }
    }

    /// Decode the persisted session. `None` when the file is absent or
    /// empty (a fresh install). Decode failures are fatal at startup.
    pub fn load(&self) -> Result<Option<Session>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(None);
        }

        let session: Session = bincode::deserialize(&bytes).map_err(|e| {
            WatchtreeError::Session(format!(
                "failed to decode session file [{}]: {e}",
                self.path.display()
            ))
        })?;

        if session.version > SESSION_VERSION {
            return Err(WatchtreeError::Session(format!(
                "session file [{}] has version {} but this build supports {}",
                self.path.display(),
                session.version,
                SESSION_VERSION
            )));
        }

        Ok(Some(session))
    }

    /// Encode and write the session atomically: a temp file in the same
    /// directory, then rename over the destination.
    pub fn save(&self, session: &Session) -> Result<()> {
        let bytes = bincode::serialize(session)
            .map_err(|e| WatchtreeError::Session(format!("failed to encode session: {e}")))?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path)
            .map_err(|e| WatchtreeError::Session(format!("failed to persist session: {e}")))?;

        Ok(())
    }
}

/// Split a decoded session into the seed status list and the synthetic
/// requests that re-run targets interrupted by the previous shutdown.
///
/// Statuses whose target no longer exists in the config are pruned.
/// `Pending` and `Resumed` entries are treated as if they had started, so a
/// target that never got to run before shutdown is still resumed.
pub fn resume_session(
    session: Session,
    targets: &[Target],
) -> (Vec<Status>, Vec<ExecRequest>) {
    let mut seed = Vec::new();
    let mut requests = Vec::new();

    for mut status in session.statuses {
        if matches!(
            status.cause,
            Some(TargetStatus::Resumed) | Some(TargetStatus::Pending)
        ) {
            status.cause = Some(TargetStatus::Started);
        }

        let Some(target) = targets.iter().find(|t| t.id == status.target_id) else {
            debug!(target_id = %status.target_id, "pruned unknown target before session resume");
            continue;
        };

        if status.cause == Some(TargetStatus::Started) {
            status.cause = Some(TargetStatus::Resumed);
            info!(target_id = %status.target_id, "resume scheduled");
            requests.push(ExecRequest::synthetic(
                "resume",
                &target.id,
                &target.label,
                target.tree.clone(),
            ));
        }

        seed.push(status);
    }

    (seed, requests)
}

/// Maintains the user-visible status list (at most one entry per target)
/// and mirrors every change to the session store.
///
/// This is the single writer of the session file; coalescing falls out of
/// the board only saving after it has applied a change.
#[derive(Debug)]
pub struct StatusBoard {
    statuses: Vec<Status>,
    store: Option<SessionStore>,
    run_len_history: HashMap<String, Duration>,
}

impl StatusBoard {
    pub fn new(seed: Vec<Status>, store: Option<SessionStore>) -> Self {
        StatusBoard {
            statuses: seed,
            store,
            run_len_history: HashMap::new(),
        }
    }

    pub fn statuses(&self) -> &[Status] {
        &self.statuses
    }

    /// Duration of the target's last successful run, if any.
    pub fn last_run_len(&self, target_id: &str) -> Option<Duration> {
        self.run_len_history.get(target_id).copied()
    }

    /// Apply one status event to the list. Returns true when the list
    /// changed (and the session should be persisted).
    pub fn apply(&mut self, event: StatusEvent) -> bool {
        match event {
            StatusEvent::Status(status) => {
                let existing = self
                    .statuses
                    .iter()
                    .position(|s| s.target_id == status.target_id);

                if matches!(
                    status.cause,
                    Some(TargetStatus::Failed) | Some(TargetStatus::Canceled)
                ) {
                    // If new activity already flipped this target back to
                    // pending, keep that state instead of bouncing it
                    // through started -> pending -> failed.
                    if let Some(pos) = existing {
                        if self.statuses[pos].cause == Some(TargetStatus::Pending) {
                            return false;
                        }
                    }
                }

                match existing {
                    Some(pos) => {
                        debug!(target = %status.target_label, cause = ?status.cause, "replace status");
                        self.statuses[pos] = status;
                    }
                    None => {
                        debug!(target = %status.target_label, cause = ?status.cause, "add status");
                        self.statuses.insert(0, status);
                    }
                }
                true
            }
            StatusEvent::TargetPass(pass) => {
                self.run_len_history
                    .insert(pass.target_id.clone(), pass.run_len);
                let before = self.statuses.len();
                self.statuses.retain(|s| s.target_id != pass.target_id);
                self.statuses.len() != before
            }
            StatusEvent::TreePass(_) => false,
        }
    }

    /// Consume the status stream until it closes, persisting after every
    /// applied change. Encode failures are logged and swallowed.
    pub async fn run(mut self, mut rx: mpsc::Receiver<StatusEvent>) {
        while let Some(event) = rx.recv().await {
            if self.apply(event) {
                self.persist();
            }
        }
        debug!("status stream closed; board exiting");
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&Session::new(self.statuses.clone())) {
                warn!(error = %e, "failed to save session");
            }
        }
    }
}
