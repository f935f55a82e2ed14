//! Crate-wide error kinds and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchtreeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Watch registration error: {0}")]
    Watch(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WatchtreeError>;

impl WatchtreeError {
    /// Convenience for the many resolver checks that fail with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        WatchtreeError::Config(msg.into())
    }
}
