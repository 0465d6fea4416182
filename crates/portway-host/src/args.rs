//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

/// Local orchestration host for the desktop client.
///
/// Runs the process and IPC layer the UI talks to: proxy sessions via
/// the external client binary, background daemons over Unix sockets,
/// multiplexed shell terminals, and RDP viewer launch.
#[derive(Debug, Parser)]
#[command(name = "portway", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the host server on the local Unix socket
    Serve,

    /// Internal: run the terminal multiplexing worker over stdio
    #[command(name = "terminal-worker", hide = true)]
    TerminalWorker,

    /// Send one command to a running host and print the response
    #[command(after_help = "\
Examples:
  portway call '{\"name\":\"getOrigin\"}'
  portway call '{\"name\":\"cliExists\"}'
  portway call '{\"name\":\"search\",\"payload\":{\"query\":\"db server\"}}'")]
    Call(CallArgs),
}

#[derive(Debug, clap::Args)]
pub struct CallArgs {
    /// The command as JSON (without the request id)
    pub command: String,
}
