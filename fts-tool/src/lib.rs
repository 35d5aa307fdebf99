use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use crate::config::Config;

pub mod commands;
mod config;
pub mod image;

pub use config::{ImageArgs, PartitionArgs};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "./fts.toml")]
    pub config: PathBuf,

    /// Log more, repeat for even more (overridden per module by RUST_LOG)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub commands: Option<Commands>,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create an erased flash image
    Create {
        /// Overwrite an existing image
        #[arg(short, long)]
        force: bool,
    },
    /// Scan the partition and report the current record
    Init,
    /// Print the value of a key
    Get {
        key: String,
        /// Truncate the printed value to this many bytes
        #[arg(long, value_name = "N")]
        max_len: Option<usize>,
    },
    /// Store a value under a key
    Set {
        key: String,
        value: String,
        /// Truncate the stored value to this many bytes
        #[arg(long, value_name = "N")]
        max_len: Option<usize>,
    },
    /// Remove a key
    Remove { key: String },
    /// Print all key-value pairs of the current record
    Dump,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity() {
        let cli = Cli::parse_from(["fts-tool", "dump"]);
        assert_eq!(cli.log_level(), log::LevelFilter::Warn);

        let cli = Cli::parse_from(["fts-tool", "-vv", "--config", "board.toml", "dump"]);
        assert_eq!(cli.log_level(), log::LevelFilter::Debug);
        assert_eq!(cli.config, PathBuf::from("board.toml"));
        assert!(matches!(cli.commands, Some(Commands::Dump)));
    }
}
