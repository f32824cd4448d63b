use clap::Parser;
use radiance_lib::ipc;
use std::path::PathBuf;

/// Radiance service daemon: owns the tunnel and the local control socket.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Specify control socket path
    #[arg(short, long, env = ipc::ENV_VAR_SOCKET_PATH)]
    pub socket_path: Option<PathBuf>,

    /// Packet forwarder binary to run
    #[arg(long)]
    pub forwarder_binary: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}
