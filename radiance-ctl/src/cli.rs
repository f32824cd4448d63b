use clap::{Parser, Subcommand};
use radiance_lib::ipc;
use std::path::PathBuf;

/// Radiance control interface for the Radiance service
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Specify control socket path
    #[arg(short, long, env = ipc::ENV_VAR_SOCKET_PATH)]
    pub socket_path: Option<PathBuf>,

    /// Format output as json
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Query current tunnel status
    #[command()]
    Status {},

    /// Follow status events as they happen
    #[command()]
    Watch {},

    /// Start the tunnel
    #[command()]
    Start {
        /// Group to start in (lantern, user, all)
        #[arg(long)]
        group: Option<String>,

        /// Outbound tag to select after start
        #[arg(long)]
        tag: Option<String>,
    },

    /// Stop the tunnel
    #[command()]
    Stop {},

    /// Restart the tunnel keeping the current selection
    #[command()]
    Restart {},

    /// Show or set the clash mode (auto, lantern, user)
    #[command()]
    Mode {
        /// Mode to switch to; omit to print the current one
        mode: Option<String>,
    },

    /// Show the user-selected outbound
    #[command()]
    Selected {},

    /// Select an outbound within a group
    #[command()]
    Select {
        /// Group tag (lantern or user)
        group: String,

        /// Outbound tag
        tag: String,
    },

    /// Show the concrete outbound traffic currently uses
    #[command()]
    Active {},

    /// List outbound groups and their members
    #[command()]
    Groups {},

    /// List tracked connections
    #[command()]
    Connections {},

    /// Close connections by id
    #[command()]
    CloseConnections {
        /// Connection ids
        ids: Vec<String>,
    },

    /// Show service metrics
    #[command()]
    Metrics {},
}

pub fn parse() -> Cli {
    Cli::parse()
}
