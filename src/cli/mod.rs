pub mod stdio;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "compass-extension")]
#[command(about = "Compass wallet extension background", long_about = None)]
pub struct Cli {
    /// Path of the TOML config file (created with defaults if missing)
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,
    /// Keep everything in memory, ignoring the storage section
    #[arg(long, default_value = "false")]
    pub ephemeral: bool,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Serve ports over stdin/stdout, one JSON frame per line
    Run,
    /// Print the effective configuration
    Config,
}
