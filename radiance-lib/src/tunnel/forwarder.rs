//! Seam to the embedded packet forwarder.
//!
//! The forwarder turns IP packets into per-flow dialer invocations; anything
//! providing these operations satisfies the tunnel service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use std::io;
use std::sync::Arc;

use crate::options::Options;

#[derive(Debug, Error)]
pub enum Error {
    #[error("forwarder not running")]
    NotRunning,
    #[error("outbound group not found: {0}")]
    GroupNotFound(String),
    #[error("outbound tag not found: {0}")]
    TagNotFound(String),
    #[error("forwarder failure: {0}")]
    Failed(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("control api error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One tracked flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    #[serde(default)]
    pub inbound: String,
    #[serde(default)]
    pub outbound: String,
    /// Outbound chain, root group first.
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub uplink_total: u64,
    pub downlink_total: u64,
}

/// A node of the live outbound tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// For groups: the currently chosen child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl OutboundInfo {
    pub fn is_group(&self) -> bool {
        !self.children.is_empty()
    }
}

#[async_trait]
pub trait TrafficManager: Send + Sync {
    async fn total(&self) -> Result<Traffic, Error>;
    async fn connections(&self) -> Result<Vec<Connection>, Error>;
    async fn closed_connections(&self) -> Result<Vec<Connection>, Error>;
    async fn close(&self, ids: &[String]) -> Result<(), Error>;
    async fn close_all(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait OutboundManager: Send + Sync {
    async fn outbounds(&self) -> Result<Vec<OutboundInfo>, Error>;
    async fn outbound(&self, tag: &str) -> Result<Option<OutboundInfo>, Error>;
    async fn select(&self, group_tag: &str, outbound_tag: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait PacketForwarder: Send + Sync {
    async fn start(&self, options: Options) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
    async fn mode(&self) -> Result<String, Error>;
    async fn set_mode(&self, mode: &str) -> Result<(), Error>;
    fn traffic(&self) -> Arc<dyn TrafficManager>;
    fn outbounds(&self) -> Arc<dyn OutboundManager>;
    /// Receives a cause when the forwarder exits without `close` being
    /// called.
    fn exit_watch(&self) -> watch::Receiver<Option<String>>;
}
