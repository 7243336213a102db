//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use taskpool_core::config::DEFAULT_CONFIG_FILE;
use taskpool_core::observability::LogFormat;

/// Drive the task pool engine against the configured store.
#[derive(Debug, Parser)]
#[command(name = "taskpool", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Override the log format from the configuration file.
    #[arg(long, global = true)]
    pub log_format: Option<LogArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogArg {
    Json,
    Pretty,
    Compact,
}

impl From<LogArg> for LogFormat {
    fn from(arg: LogArg) -> Self {
        match arg {
            LogArg::Json => LogFormat::Json,
            LogArg::Pretty => LogFormat::Pretty,
            LogArg::Compact => LogFormat::Compact,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Two reviewers in one group race for a single approval.
    Demo,

    /// Many members of one group claim the same task at once.
    Race {
        /// Number of concurrent claimants.
        #[arg(long, default_value_t = 8)]
        claimants: usize,
    },

    /// Print store-wide counts.
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_race_with_claimants() {
        let cli = Cli::parse_from(["taskpool", "race", "--claimants", "16"]);
        match cli.command {
            Command::Race { claimants } => assert_eq!(claimants, 16),
            _ => panic!("expected Race command"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn cli_accepts_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["taskpool", "demo", "--log-format", "json", "--config", "x.toml"]);
        assert!(matches!(cli.command, Command::Demo));
        assert!(matches!(cli.log_format, Some(LogArg::Json)));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
