//! `{{.key}}` template expansion for config strings and command lines.
//!
//! Every key appearing in an input must be declared in the substitution map;
//! a missing key is an error rather than a silent sentinel expansion.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};

/// Names available inside `exec.cmd` at dispatch time.
pub const RUNTIME_KEYS: [&str; 6] = [
    "Dir",
    "HandlerLabel",
    "IncludeGlob",
    "IncludeRoot",
    "Path",
    "TargetLabel",
];

/// Values substituted into `exec.cmd` when a run starts.
#[derive(Debug, Clone, Default)]
pub struct CmdVars {
    /// Parent directory of `path`.
    pub dir: String,
    pub handler_label: String,
    pub include_glob: String,
    pub include_root: String,
    /// Absolute path of the file or directory that triggered the run.
    pub path: String,
    pub target_label: String,
}

impl CmdVars {
    pub fn from_parts(
        path: &Path,
        handler_label: &str,
        include: &crate::glob::Glob,
        target_label: &str,
    ) -> Self {
        CmdVars {
            dir: path
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            handler_label: handler_label.to_string(),
            include_glob: include.pattern.clone(),
            include_root: include.root.display().to_string(),
            path: path.display().to_string(),
            target_label: target_label.to_string(),
        }
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("Dir".to_string(), self.dir),
            ("HandlerLabel".to_string(), self.handler_label),
            ("IncludeGlob".to_string(), self.include_glob),
            ("IncludeRoot".to_string(), self.include_root),
            ("Path".to_string(), self.path),
            ("TargetLabel".to_string(), self.target_label),
        ])
    }
}

/// Expand every `{{.key}}` occurrence in `input` from `vars`.
///
/// Fails on a key absent from `vars` and on unterminated `{{.` sequences.
/// Text outside placeholders is copied through untouched.
pub fn expand(input: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{.") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 3..];
        let Some(end) = after.find("}}") else {
            bail!("unterminated template variable in [{input}]");
        };
        let key = &after[..end];
        if key.is_empty() || key.contains(|c: char| c.is_whitespace()) {
            bail!("malformed template variable [{{{{.{key}}}}}] in [{input}]");
        }
        match vars.get(key) {
            Some(value) => out.push_str(value),
            None => bail!("unknown template variable [{key}] in [{input}]"),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Substitution map for config-time expansion: the user's `[template]` table
/// plus identity entries for the runtime keys, so `{{.Path}}` and friends
/// survive config resolution verbatim and expand at dispatch time.
pub fn config_vars(template: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut vars = template.clone();
    for key in RUNTIME_KEYS {
        vars.insert(key.to_string(), format!("{{{{.{key}}}}}"));
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn expands_declared_keys() {
        let out = expand("go test {{.pkg}} -v", &vars(&[("pkg", "./...")])).unwrap();
        assert_eq!(out, "go test ./... -v");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = expand("{{.missing}}", &vars(&[])).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn unterminated_variable_is_an_error() {
        assert!(expand("{{.oops", &vars(&[("oops", "x")])).is_err());
    }

    #[test]
    fn config_vars_pass_runtime_keys_through() {
        let cfg = config_vars(&vars(&[("repo", "/src/app")]));
        let out = expand("cd {{.repo}} && lint {{.Path}}", &cfg).unwrap();
        assert_eq!(out, "cd /src/app && lint {{.Path}}");

        let cmd = CmdVars {
            path: "/src/app/main.rs".into(),
            ..CmdVars::default()
        };
        let final_cmd = expand(&out, &cmd.into_map()).unwrap();
        assert_eq!(final_cmd, "cd /src/app && lint /src/app/main.rs");
    }

    #[test]
    fn literal_text_unchanged() {
        let out = expand("echo {ok} {{ still fine", &vars(&[])).unwrap();
        assert_eq!(out, "echo {ok} {{ still fine");
    }
}
