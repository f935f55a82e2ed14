//! Raw configuration as read from a TOML file.
//!
//! This is a direct serde mapping with no semantic validation; the resolver
//! in [`super::resolve`] turns it into runtime [`crate::target::Target`]
//! values or fails with a configuration error.
//!
//! ```toml
//! [data.session]
//! file = "/home/me/.watchtree/session"
//!
//! [global]
//! cooldown = "5s"
//! exclude = [{ pattern = "**/.git/**" }]
//!
//! [template]
//! repo = "/home/me/src/app"
//!
//! auto_start_target = ["lint"]
//!
//! [[target]]
//! label = "app sources"
//! id = "app"
//! root = "{{.repo}}"
//! debounce = "2s"
//! include = [{ pattern = "**/*.rs" }]
//!
//! [[target.handler]]
//! label = "check"
//!
//! [[target.handler.exec]]
//! cmd = "cargo check"
//! timeout = "5m"
//! env = ["CARGO_TERM_COLOR=never"]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

/// Default `target.debounce`.
pub const DEFAULT_DEBOUNCE: &str = "15s";

/// Default `exec.timeout`.
pub const DEFAULT_CMD_TIMEOUT: &str = "15m";

/// Default `global.cooldown`.
pub const DEFAULT_COOLDOWN: &str = "5s";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    /// Program-state storage settings.
    #[serde(default)]
    pub data: DataSection,

    /// Properties applied to all targets.
    #[serde(default)]
    pub global: GlobalSection,

    /// Key/value pairs usable in some string fields via `{{.key}}`.
    #[serde(default)]
    pub template: BTreeMap<String, String>,

    /// Ids of targets to run when the process starts.
    #[serde(default)]
    pub auto_start_target: Vec<String>,

    #[serde(default)]
    pub target: Vec<RawTarget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataSection {
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSection {
    /// Path of the session file. Empty disables persistence.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalSection {
    /// How long to wait after one command finishes before starting another.
    #[serde(default)]
    pub cooldown: Option<String>,

    /// Appended to every target's exclude list.
    #[serde(default)]
    pub exclude: Vec<RawGlob>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawGlob {
    /// Relative doublestar pattern, e.g. `**/*.rs`.
    pub pattern: String,

    /// Optional root, relative to the target root. Defaults to the target
    /// root itself.
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawTarget {
    /// Required, unique, shown to users.
    pub label: String,

    /// Optional unique id; synthesized from label and root when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Directory all relative patterns and dirs resolve against. Required
    /// when `include` is non-empty.
    #[serde(default)]
    pub root: Option<String>,

    /// Duration string, e.g. `"15s"`.
    #[serde(default)]
    pub debounce: Option<String>,

    #[serde(default)]
    pub include: Vec<RawGlob>,

    #[serde(default)]
    pub exclude: Vec<RawGlob>,

    /// Ids of targets whose triggering also triggers this target.
    #[serde(default)]
    pub upstream: Vec<String>,

    #[serde(default, rename = "handler")]
    pub handlers: Vec<RawHandler>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawHandler {
    pub label: String,

    #[serde(default, rename = "exec")]
    pub execs: Vec<RawExec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawExec {
    /// A single command or a `|` pipeline.
    pub cmd: String,

    /// Working directory, relative to the target root; defaults to it.
    #[serde(default)]
    pub dir: Option<String>,

    /// Duration string; defaults to [`DEFAULT_CMD_TIMEOUT`].
    #[serde(default)]
    pub timeout: Option<String>,

    /// `KEY=VALUE` pairs overriding the inherited environment.
    #[serde(default)]
    pub env: Vec<String>,
}
