//! Command-line surface, grounded on `spkenv-spk`'s `clap`-derive CLIs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "alpenhornd", version, about = "The alpenhorn data-index management daemon")]
pub struct Cli {
    /// Path to an additional configuration file, applied after the
    /// standard search path and `ALPENHORN_CONFIG_FILE`.
    #[arg(short = 'c', long = "conf")]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon's main update loop.
    Run {
        /// Perform exactly one update pass, drain the queue, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Database maintenance subcommands.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Initialise an empty database with the schema this build expects.
    Init,
}
