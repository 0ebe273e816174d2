//! CLI module for ensemble
//!
//! Provides command-line interface for:
//! - serve: run a serving node over TCP
//! - get / set / create: one-shot client operations
//! - watch: stream session state events

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, ClientArgs, Command};
pub use commands::{create, get, run_command, serve, set, watch};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_line, write_response};

/// Parse arguments and run the selected command
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    run_command(cli.command)
}
