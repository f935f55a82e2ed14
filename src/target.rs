//! The target model: a named unit of work defined by include/exclude globs
//! plus an ordered list of handlers, linked to downstream targets that run
//! after it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::glob::{self, Glob, MatchOutcome};

/// A minimal copy of the fields needed to run one member of a tree.
///
/// `Target.tree` holds these instead of references to other targets so the
/// dispatcher hot path never touches shared mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetNode {
    pub id: String,
    pub label: String,
    pub handlers: Vec<Handler>,
}

/// A named, ordered sequence of commands within a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Handler {
    pub label: String,
    pub execs: Vec<Exec>,
}

/// A single command with its own working directory, timeout, and
/// environment overrides. `cmd` may be a `|` pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Exec {
    pub cmd: String,
    pub dir: PathBuf,
    pub timeout: Duration,
    pub env: Vec<(String, String)>,
}

/// A fully resolved target. Built once at startup from the config file and
/// immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Unique across all targets; synthesized from label and root when the
    /// config omits it.
    pub id: String,

    /// Human-readable, unique, required.
    pub label: String,

    /// Absolute directory all relative patterns and dirs resolve against.
    pub root: PathBuf,

    /// How long to wait after file activity settles before running.
    pub debounce: Duration,

    pub include: Vec<Glob>,
    pub exclude: Vec<Glob>,

    pub handlers: Vec<Handler>,

    /// Ids of targets whose triggering also triggers this target.
    pub upstream: Vec<String>,

    /// This target followed by all downstream targets in DFS pre-order,
    /// snapshotted at startup.
    pub tree: Vec<TargetNode>,
}

impl Target {
    /// Check a path against this target's include and exclude patterns.
    pub fn match_path(&self, name: &Path) -> Result<MatchOutcome> {
        glob::match_any(name, &self.include, &self.exclude)
    }

    /// The minimal record for this target alone (tree head).
    pub fn node(&self) -> TargetNode {
        TargetNode {
            id: self.id.clone(),
            label: self.label.clone(),
            handlers: self.handlers.clone(),
        }
    }
}
