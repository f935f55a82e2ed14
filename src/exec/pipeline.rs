//! Command-string parsing: shell-style word splitting with `|` pipelines.

use anyhow::{bail, Context, Result};

/// Split a command string into pipeline stages, one argv per stage.
///
/// `|` separates stages only outside quotes; quoting and escapes otherwise
/// follow POSIX shell word rules via `shell-words`.
pub fn parse_pipeline(cmd: &str) -> Result<Vec<Vec<String>>> {
    let mut stages = Vec::new();

    for part in split_unquoted_pipes(cmd)? {
        let argv = shell_words::split(&part)
            .with_context(|| format!("failed to parse command [{part}]"))?;
        if argv.is_empty() {
            bail!("empty pipeline stage in [{cmd}]");
        }
        stages.push(argv);
    }

    if stages.is_empty() {
        bail!("empty command");
    }
    Ok(stages)
}

/// Split on `|` characters that are not inside single/double quotes or
/// escaped with a backslash.
fn split_unquoted_pipes(input: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for c in input.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if !in_single => {
                current.push(c);
                escaped = true;
            }
            '\'' if !in_double => {
                current.push(c);
                in_single = !in_single;
            }
            '"' if !in_single => {
                current.push(c);
                in_double = !in_double;
            }
            '|' if !in_single && !in_double => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if in_single || in_double {
        bail!("unbalanced quotes in [{input}]");
    }
    parts.push(current);
    Ok(parts)
}
