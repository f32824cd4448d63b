//! Local control plane: HTTP over a Unix-domain socket.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};

use crate::status::Status;

pub mod auth;
pub mod client;
pub mod http;
pub mod server;

pub use client::Client;

pub const SOCKET_FILE: &str = "lantern.sock";
pub const ENV_VAR_SOCKET_PATH: &str = "RADIANCE_SOCKET_PATH";

pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join(SOCKET_FILE)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: Status,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModeBody {
    pub mode: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelectionBody {
    #[serde(rename = "groupTag")]
    pub group_tag: String,
    #[serde(rename = "outboundTag")]
    pub outbound_tag: String,
}

/// Start/restart payload. `options` may carry a full options graph as a
/// JSON string; empty means the service builds its own.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartBody {
    #[serde(default)]
    pub options: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsBody {
    pub memory: u64,
    pub goroutines: u64,
    pub connections: u64,
    #[serde(rename = "uplinkTotal")]
    pub uplink_total: u64,
    #[serde(rename = "downlinkTotal")]
    pub downlink_total: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
