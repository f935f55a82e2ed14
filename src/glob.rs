//! Include/exclude glob evaluation.
//!
//! Patterns are doublestar-style globs anchored at a root directory. After
//! config resolution every pattern is stored in absolute form (root joined
//! with the relative pattern), so matching is a literal comparison of
//! absolute paths. Symlinks are followed during expansion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::GlobMatcher;
use walkdir::WalkDir;

/// A single glob pattern anchored at an absolute root directory.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Glob {
    /// Absolute pattern after resolution, e.g. `/repo/src/**/*.rs`.
    pub pattern: String,

    /// Absolute directory the pattern was anchored at.
    pub root: PathBuf,
}

impl Glob {
    pub fn new(pattern: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Glob {
            pattern: pattern.into(),
            root: root.into(),
        }
    }

    fn matcher(&self) -> Result<GlobMatcher> {
        let glob = globset::Glob::new(&self.pattern)
            .with_context(|| format!("invalid glob pattern [{}]", self.pattern))?;
        Ok(glob.compile_matcher())
    }
}

/// Concrete paths claimed by one include pattern.
///
/// `include` holds every path that matched the pattern and no exclude, plus
/// every ancestor directory of a match up to and including the include root.
/// `exclude` holds paths that matched the include but were rejected by an
/// exclude pattern.
#[derive(Debug, Clone, Default)]
pub struct GlobResult {
    pub include: BTreeMap<PathBuf, Glob>,
    pub exclude: BTreeMap<PathBuf, Glob>,
}

/// Outcome of matching one path against include/exclude lists.
#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    /// True when at least one include matched and no exclude matched.
    pub matched: bool,

    /// First include that matched, in declaration order.
    pub include: Option<Glob>,

    /// First exclude that matched, in declaration order.
    pub exclude: Option<Glob>,
}

/// Match a path against include and exclude pattern lists.
///
/// Ties break on declaration order for both lists: the reported include is
/// the first that matched, likewise for the exclude.
pub fn match_any(name: &Path, include: &[Glob], exclude: &[Glob]) -> Result<MatchOutcome> {
    let mut out = MatchOutcome::default();

    for glob in include {
        if glob.matcher()?.is_match(name) {
            out.include = Some(glob.clone());
            break;
        }
    }
    for glob in exclude {
        if glob.matcher()?.is_match(name) {
            out.exclude = Some(glob.clone());
            break;
        }
    }

    out.matched = out.include.is_some() && out.exclude.is_none();
    Ok(out)
}

/// Search the filesystem for paths matching each include pattern.
///
/// Returns one `GlobResult` per include, in declaration order. Each result
/// also carries the ancestor directories of every match (up to the include
/// root) so that watches on those directories can observe files created
/// later at any depth. An include with no matches at all still claims its
/// root for the same reason.
pub fn expand(include: &[Glob], exclude: &[Glob]) -> Result<Vec<GlobResult>> {
    let mut list = Vec::with_capacity(include.len());

    let exclude_matchers = exclude
        .iter()
        .map(|e| e.matcher())
        .collect::<Result<Vec<_>>>()?;

    for inc in include {
        let mut result = GlobResult::default();
        let matcher = inc.matcher()?;

        for entry in WalkDir::new(&inc.root).follow_links(true) {
            let entry = match entry {
                Ok(e) => e,
                // Unreadable subtrees are skipped rather than fatal; the
                // watch set just ends up smaller.
                Err(err) => {
                    tracing::debug!(root = %inc.root.display(), error = %err, "glob walk error");
                    continue;
                }
            };
            let path = entry.path();
            if !matcher.is_match(path) {
                continue;
            }

            let excluded = exclude_matchers.iter().any(|m| m.is_match(path));

            if excluded {
                result.exclude.insert(path.to_path_buf(), inc.clone());
            } else {
                result.include.insert(path.to_path_buf(), inc.clone());
            }
        }

        // Watch the ancestor chain of every match so new entries created in
        // intermediate directories are observable.
        let matched: Vec<PathBuf> = result.include.keys().cloned().collect();
        for path in matched {
            for ancestor in ancestors_under(&path, &inc.root) {
                result.include.entry(ancestor).or_insert_with(|| inc.clone());
            }
        }

        // Even with no matches (e.g. the root is currently empty) the root
        // itself may host file creations later.
        if result.include.is_empty() && result.exclude.is_empty() {
            result.include.insert(inc.root.clone(), inc.clone());
        }

        list.push(result);
    }

    Ok(list)
}

/// Merge per-include results into a single watch set.
///
/// When multiple includes claim the same path, the first include in
/// declaration order wins.
pub fn combine(results: &[GlobResult]) -> BTreeMap<PathBuf, Glob> {
    let mut paths = BTreeMap::new();
    for result in results {
        for (path, glob) in &result.include {
            paths
                .entry(path.clone())
                .or_insert_with(|| glob.clone());
        }
    }
    paths
}

/// Directories `d` with `root <= d <= parent(path)`, nearest first.
fn ancestors_under(path: &Path, root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if !dir.starts_with(root) {
            break;
        }
        out.push(dir.to_path_buf());
        if dir == root {
            break;
        }
        current = dir.parent();
    }
    out
}
