//! CLI argument parsing using `clap` derive.

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `watchtree`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "watchtree",
    version,
    about = "Watch files, debounce activity, and run command trees.",
    long_about = None
)]
pub struct Cli {
    /// Path to the config file (TOML).
    #[arg(
        long,
        short = 'c',
        value_name = "PATH",
        global = true,
        default_value = "Watchtree.toml"
    )]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WATCHTREE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Check whether a file/dir path would trigger a target.
    Eval {
        /// Path to test against the configured include patterns.
        #[arg(value_name = "PATH")]
        subject: String,
    },

    /// Run one target (and its downstream tree) on demand.
    Run {
        /// Id of the target to run.
        #[arg(value_name = "TARGET_ID")]
        target_id: String,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `Cli::parse()`.
pub fn parse() -> Cli {
    Cli::parse()
}
