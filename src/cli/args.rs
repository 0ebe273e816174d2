//! CLI argument definitions using clap
//!
//! Commands:
//! - ensemble serve --config <path>
//! - ensemble get --roster <hosts> <path>
//! - ensemble set --roster <hosts> <path> <data>
//! - ensemble create --roster <hosts> <path> [data]
//! - ensemble watch --roster <hosts>

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// ensemble - read-only capable coordination sessions
#[derive(Parser, Debug)]
#[command(name = "ensemble")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Connection options shared by client commands
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Comma separated host:port list
    #[arg(long)]
    pub roster: String,

    /// Path to a client configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Accept read-only servers when no quorum is reachable
    #[arg(long)]
    pub allow_read_only: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a serving node
    Serve {
        /// Path to node configuration file
        #[arg(long, default_value = "./ensemble-node.json")]
        config: PathBuf,
    },

    /// Read a node's data
    Get {
        #[command(flatten)]
        client: ClientArgs,

        path: String,
    },

    /// Overwrite a node's data
    Set {
        #[command(flatten)]
        client: ClientArgs,

        path: String,

        data: String,

        /// Expected version, -1 for any
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        version: i32,
    },

    /// Create a node
    Create {
        #[command(flatten)]
        client: ClientArgs,

        path: String,

        #[arg(default_value = "")]
        data: String,
    },

    /// Print session state events until interrupted
    Watch {
        #[command(flatten)]
        client: ClientArgs,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
