use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tabletop", about = "Shared tabletop board tools", version)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the flat delta that importing a board would send
    Flatten {
        /// Board file
        board: PathBuf,

        /// First piece index to assign
        #[arg(long, default_value_t = 0)]
        start_index: u64,
    },

    /// Summarize a board file
    Inspect {
        /// Board file
        board: PathBuf,
    },

    /// Load a board through one client and watch others converge
    Simulate {
        /// Board file
        board: PathBuf,

        /// Number of connected clients
        #[arg(long, default_value_t = 2)]
        clients: usize,

        /// Seconds to wait for all clients to converge
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}
