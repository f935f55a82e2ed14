//! Config file loading.

use std::path::Path;

use crate::config::model::RawConfig;
use crate::config::resolve::{self, ResolvedConfig};
use crate::errors::Result;

/// Deserialize a TOML config file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let raw: RawConfig = toml::from_str(&contents)?;
    Ok(raw)
}

/// Load and fully resolve a config file. The recommended entry point:
/// everything past this call works with validated, absolute, parsed values.
pub fn load_and_resolve(path: impl AsRef<Path>) -> Result<ResolvedConfig> {
    let raw = load_from_path(&path)?;
    resolve::resolve(raw)
}
