//! Config resolution: template expansion, normalization, validation, and
//! target linking.
//!
//! Resolution is a fatal-on-error startup step. Afterwards every pattern is
//! absolute, every duration parsed, every path verified, and each target
//! carries a value-snapshot `tree` of itself plus its downstream targets so
//! the runtime never walks shared references.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{
    RawConfig, RawGlob, RawTarget, DEFAULT_CMD_TIMEOUT, DEFAULT_COOLDOWN, DEFAULT_DEBOUNCE,
};
use crate::errors::{Result, WatchtreeError};
use crate::glob::Glob;
use crate::session;
use crate::target::{Exec, Handler, Target, TargetNode};
use crate::template;

/// Fully validated runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub targets: Vec<Target>,
    pub cooldown: Duration,
    pub session_file: Option<PathBuf>,
    /// Indices into `targets` for `auto_start_target` entries, in order.
    pub auto_start: Vec<usize>,
}

impl ResolvedConfig {
    pub fn target_by_id(&self, id: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.id == id)
    }
}

pub fn resolve(raw: RawConfig) -> Result<ResolvedConfig> {
    // Validate the session file path early (vs. the first status-driven
    // write) by ensuring intermediate directories exist and it is writable.
    let session_file = match raw.data.session.file.as_deref() {
        Some(file) if !file.is_empty() => {
            let path = PathBuf::from(file);
            session::prepare_session_file(&path)?;
            Some(path)
        }
        _ => None,
    };

    let cooldown = parse_duration(
        raw.global.cooldown.as_deref().unwrap_or(DEFAULT_COOLDOWN),
        "global cooldown",
    )?;

    let vars = template::config_vars(&raw.template);

    let mut targets = Vec::with_capacity(raw.target.len());
    let mut seen_labels: HashMap<String, ()> = HashMap::new();
    for raw_target in &raw.target {
        let target = resolve_target(raw_target, &raw.global.exclude, &vars)?;

        if seen_labels.insert(target.label.clone(), ()).is_some() {
            return Err(WatchtreeError::config(format!(
                "target label [{}] was used more than once",
                target.label
            )));
        }
        targets.push(target);
    }

    let mut seen_ids: HashMap<&str, &str> = HashMap::new();
    for target in &targets {
        if let Some(prior) = seen_ids.insert(&target.id, &target.label) {
            return Err(WatchtreeError::config(format!(
                "target [{}] has an id [{}] that is already used by target [{prior}]",
                target.label, target.id
            )));
        }
    }

    for target in &targets {
        for up in &target.upstream {
            if !seen_ids.contains_key(up.as_str()) {
                return Err(WatchtreeError::config(format!(
                    "target [{}] has an unknown upstream id [{up}]",
                    target.label
                )));
            }
        }
    }

    ensure_acyclic(&targets)?;
    link_trees(&mut targets)?;

    let mut auto_start = Vec::with_capacity(raw.auto_start_target.len());
    for id in &raw.auto_start_target {
        let Some(idx) = targets.iter().position(|t| &t.id == id) else {
            return Err(WatchtreeError::config(format!(
                "cannot auto-start target [{id}]: id not found"
            )));
        };
        auto_start.push(idx);
    }

    Ok(ResolvedConfig {
        targets,
        cooldown,
        session_file,
        auto_start,
    })
}

fn resolve_target(
    raw: &RawTarget,
    global_exclude: &[RawGlob],
    vars: &BTreeMap<String, String>,
) -> Result<Target> {
    if raw.label.is_empty() {
        return Err(WatchtreeError::config("target is missing a [label] field"));
    }
    let label = &raw.label;

    let expand = |field: &str, what: &str| -> Result<String> {
        template::expand(field, vars).map_err(|e| {
            WatchtreeError::config(format!("target [{label}]: failed to expand {what}: {e}"))
        })
    };

    let root_str = expand(raw.root.as_deref().unwrap_or_default(), "root")?;
    if root_str.is_empty() && !raw.include.is_empty() {
        return Err(WatchtreeError::config(format!(
            "target [{label}] is missing a [root] field"
        )));
    }
    // Targets without includes (run/auto-start only) fall back to the
    // working directory for command resolution.
    let root = if root_str.is_empty() {
        std::env::current_dir()?.canonicalize()?
    } else {
        canonical_dir(Path::new(&root_str), label, "root")?
    };

    let debounce_str = expand(raw.debounce.as_deref().unwrap_or(DEFAULT_DEBOUNCE), "debounce")?;
    let debounce = parse_duration(&debounce_str, &format!("target [{label}] debounce"))?;

    let include = resolve_globs(&raw.include, &root, label, "include")?;

    let mut raw_exclude = raw.exclude.clone();
    // Global excludes resolve relative to each target's root, so appending
    // them here lets them share the per-target resolution path.
    raw_exclude.extend(global_exclude.iter().cloned());
    let exclude = resolve_globs(&raw_exclude, &root, label, "exclude")?;

    let mut handlers = Vec::with_capacity(raw.handlers.len());
    for raw_handler in &raw.handlers {
        let mut execs = Vec::with_capacity(raw_handler.execs.len());
        for raw_exec in &raw_handler.execs {
            let cmd = expand(&raw_exec.cmd, "exec cmd")?;
            let dir_str = expand(raw_exec.dir.as_deref().unwrap_or_default(), "exec dir")?;
            let dir = if dir_str.is_empty() {
                root.clone()
            } else {
                let joined = root.join(&dir_str);
                let dir = canonical_dir(&joined, label, "exec dir")?;
                if !dir.starts_with(&root) {
                    return Err(WatchtreeError::config(format!(
                        "target [{label}] handler [{}] exec dir [{}] is outside the target root [{}]",
                        raw_handler.label,
                        dir.display(),
                        root.display()
                    )));
                }
                dir
            };

            let timeout_str = expand(
                raw_exec.timeout.as_deref().unwrap_or(DEFAULT_CMD_TIMEOUT),
                "exec timeout",
            )?;
            let timeout = parse_duration(
                &timeout_str,
                &format!("target [{label}] handler [{}] timeout", raw_handler.label),
            )?;

            let mut env = Vec::with_capacity(raw_exec.env.len());
            for pair in &raw_exec.env {
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(WatchtreeError::config(format!(
                        "target [{label}] env entry [{pair}] is not KEY=VALUE"
                    )));
                };
                env.push((key.to_string(), value.to_string()));
            }

            execs.push(Exec {
                cmd,
                dir,
                timeout,
                env,
            });
        }
        handlers.push(Handler {
            label: raw_handler.label.clone(),
            execs,
        });
    }

    let id = match raw.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("{label}@{}", root.display()),
    };

    Ok(Target {
        id,
        label: label.clone(),
        root,
        debounce,
        include,
        exclude,
        handlers,
        upstream: raw.upstream.clone(),
        tree: Vec::new(), // filled by link_trees
    })
}

/// Default glob roots to the target root, resolve relative roots under it,
/// verify containment, and anchor patterns absolutely.
fn resolve_globs(
    raw_globs: &[RawGlob],
    target_root: &Path,
    label: &str,
    what: &str,
) -> Result<Vec<Glob>> {
    let mut globs = Vec::with_capacity(raw_globs.len());

    for raw in raw_globs {
        if raw.pattern.is_empty() {
            return Err(WatchtreeError::config(format!(
                "target [{label}] contains an [{what}] with an empty pattern"
            )));
        }
        if Path::new(&raw.pattern).is_absolute() {
            return Err(WatchtreeError::config(format!(
                "target [{label}] {what} pattern [{}] must be relative",
                raw.pattern
            )));
        }

        let root = match raw.root.as_deref() {
            None | Some("") => target_root.to_path_buf(),
            Some(rel) => {
                if Path::new(rel).is_absolute() {
                    return Err(WatchtreeError::config(format!(
                        "target [{label}] {what} root [{rel}] must be relative to the target root"
                    )));
                }
                canonical_dir(&target_root.join(rel), label, &format!("{what} root"))?
            }
        };

        if !root.starts_with(target_root) {
            return Err(WatchtreeError::config(format!(
                "target [{label}] has an {what} root [{}] outside the target root [{}]",
                root.display(),
                target_root.display()
            )));
        }

        let pattern = format!("{}/{}", root.display(), raw.pattern);
        // Surface bad patterns now instead of on the first event.
        globset::Glob::new(&pattern).map_err(|e| {
            WatchtreeError::config(format!(
                "target [{label}] {what} pattern [{}]: {e}",
                raw.pattern
            ))
        })?;

        globs.push(Glob { pattern, root });
    }

    Ok(globs)
}

/// Reject cycles in the upstream relation before the tree DFS walks it.
fn ensure_acyclic(targets: &[Target]) -> Result<()> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for target in targets {
        graph.add_node(target.id.as_str());
    }
    for target in targets {
        for up in &target.upstream {
            graph.add_edge(up.as_str(), target.id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => {
            let label = targets
                .iter()
                .find(|t| t.id == cycle.node_id())
                .map(|t| t.label.as_str())
                .unwrap_or(cycle.node_id());
            Err(WatchtreeError::config(format!(
                "cycle detected in upstream relation involving target [{label}]"
            )))
        }
    }
}

/// Compute downstream links and snapshot each target's tree in DFS
/// pre-order.
fn link_trees(targets: &mut [Target]) -> Result<()> {
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); targets.len()];
    for (n, target) in targets.iter().enumerate() {
        for (o, other) in targets.iter().enumerate() {
            if other.id == target.id {
                continue;
            }
            if other.upstream.iter().any(|id| *id == target.id) {
                downstream[n].push(o);
            }
        }
    }

    for (n, target) in targets.iter().enumerate() {
        // A target with no handlers is only useful as a shared trigger for
        // downstream targets.
        if target.handlers.is_empty() && downstream[n].is_empty() {
            return Err(WatchtreeError::config(format!(
                "target [{}] cannot have 0 handlers unless it has at least 1 downstream",
                target.label
            )));
        }
    }

    let trees: Vec<Vec<TargetNode>> = (0..targets.len())
        .map(|n| {
            let mut tree = vec![targets[n].node()];
            visit_downstream(targets, &downstream, n, &mut tree);
            tree
        })
        .collect();

    for (target, tree) in targets.iter_mut().zip(trees) {
        target.tree = tree;
    }

    Ok(())
}

fn visit_downstream(
    targets: &[Target],
    downstream: &[Vec<usize>],
    n: usize,
    out: &mut Vec<TargetNode>,
) {
    for &d in &downstream[n] {
        out.push(targets[d].node());
        visit_downstream(targets, downstream, d, out);
    }
}

fn parse_duration(s: &str, what: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| WatchtreeError::config(format!("failed to parse {what} [{s}]: {e}")))
}

/// Make a directory path absolute, verify it exists and is a directory, and
/// canonicalize it for stable comparisons against watcher events.
fn canonical_dir(path: &Path, label: &str, what: &str) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let meta = std::fs::metadata(&absolute).map_err(|_| {
        WatchtreeError::config(format!(
            "target [{label}] {what} [{}] does not exist",
            absolute.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(WatchtreeError::config(format!(
            "target [{label}] {what} [{}] is not a directory",
            absolute.display()
        )));
    }

    Ok(absolute.canonicalize()?)
}
