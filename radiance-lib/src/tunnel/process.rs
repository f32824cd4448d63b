//! Packet forwarder adapter running the `lantern-box` helper binary.
//!
//! The helper owns the TUN device and the packet pipeline; this adapter
//! drives it over its clash-compatible control API and watches the child
//! for unexpected exits.

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use url::Url;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::forwarder::{
    Connection, Error, OutboundInfo, OutboundManager, PacketForwarder, Traffic, TrafficManager,
};
use crate::dirs;
use crate::options::Options;
use crate::options::builder::CLASH_API_ADDRESS;
use crate::task;

pub const DEFAULT_BINARY: &str = "lantern-box";
const OPTIONS_FILE: &str = "lantern-box-options.json";
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);
const API_POLL: Duration = Duration::from_millis(200);
const CHILD_POLL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProcessForwarder {
    inner: Arc<Inner>,
}

struct Inner {
    binary: PathBuf,
    data_dir: PathBuf,
    api: Url,
    client: reqwest::Client,
    child: tokio::sync::Mutex<Option<Child>>,
    closing: AtomicBool,
    exit_tx: watch::Sender<Option<String>>,
}

impl ProcessForwarder {
    pub fn new(binary: PathBuf, data_dir: PathBuf) -> Result<ProcessForwarder, Error> {
        let api = Url::parse(&format!("http://{CLASH_API_ADDRESS}/"))
            .map_err(|e| Error::Failed(format!("invalid control api address: {e}")))?;
        let (exit_tx, _) = watch::channel(None);
        Ok(ProcessForwarder {
            inner: Arc::new(Inner {
                binary,
                data_dir,
                api,
                client: reqwest::Client::new(),
                child: tokio::sync::Mutex::new(None),
                closing: AtomicBool::new(false),
                exit_tx,
            }),
        })
    }

    async fn api_get(&self, path: &str) -> Result<Value, Error> {
        api_get(&self.inner, path).await
    }

    async fn wait_for_api(&self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + API_READY_TIMEOUT;
        loop {
            if self.api_get("version").await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Failed("control api did not come up".to_string()));
            }
            tokio::time::sleep(API_POLL).await;
        }
    }
}

async fn api_get(inner: &Inner, path: &str) -> Result<Value, Error> {
    let url = inner
        .api
        .join(path)
        .map_err(|e| Error::Failed(format!("bad api path {path}: {e}")))?;
    let resp = inner
        .client
        .get(url)
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.json().await?)
}

#[async_trait]
impl PacketForwarder for ProcessForwarder {
    async fn start(&self, options: Options) -> Result<(), Error> {
        let mut child_slot = self.inner.child.lock().await;
        if child_slot.is_some() {
            return Ok(());
        }

        let options_path = self.inner.data_dir.join(OPTIONS_FILE);
        let bytes = serde_json::to_vec_pretty(&options)?;
        dirs::write_atomic(&options_path, &bytes, 0o600)?;

        self.inner.closing.store(false, Ordering::SeqCst);
        let child = Command::new(&self.inner.binary)
            .arg("run")
            .arg("-c")
            .arg(&options_path)
            .kill_on_drop(true)
            .spawn()?;
        tracing::info!(pid = ?child.id(), binary = %self.inner.binary.display(), "forwarder started");
        *child_slot = Some(child);
        drop(child_slot);

        spawn_child_watch(self.inner.clone());
        self.wait_for_api().await
    }

    async fn close(&self) -> Result<(), Error> {
        self.inner.closing.store(true, Ordering::SeqCst);
        let mut child_slot = self.inner.child.lock().await;
        let Some(mut child) = child_slot.take() else {
            return Ok(());
        };
        child.start_kill()?;
        match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
            Ok(Ok(status)) => tracing::info!(?status, "forwarder stopped"),
            Ok(Err(e)) => tracing::warn!(error = ?e, "waiting for forwarder exit failed"),
            Err(_) => tracing::warn!("forwarder did not exit in time"),
        }
        Ok(())
    }

    async fn mode(&self) -> Result<String, Error> {
        let configs = self.api_get("configs").await?;
        Ok(configs
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn set_mode(&self, mode: &str) -> Result<(), Error> {
        let url = self
            .inner
            .api
            .join("configs")
            .map_err(|e| Error::Failed(format!("bad api path: {e}")))?;
        self.inner
            .client
            .patch(url)
            .json(&json!({"mode": mode}))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn traffic(&self) -> Arc<dyn TrafficManager> {
        Arc::new(ClashTraffic {
            inner: self.inner.clone(),
        })
    }

    fn outbounds(&self) -> Arc<dyn OutboundManager> {
        Arc::new(ClashOutbounds {
            inner: self.inner.clone(),
        })
    }

    fn exit_watch(&self) -> watch::Receiver<Option<String>> {
        self.inner.exit_tx.subscribe()
    }
}

fn spawn_child_watch(inner: Arc<Inner>) {
    task::spawn_guarded("forwarder-watch", async move {
        loop {
            tokio::time::sleep(CHILD_POLL).await;
            let mut child_slot = inner.child.lock().await;
            let Some(child) = child_slot.as_mut() else { return };
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(status)) => {
                    *child_slot = None;
                    if !inner.closing.load(Ordering::SeqCst) {
                        let cause = format!("forwarder exited unexpectedly: {status}");
                        tracing::error!(%cause, "forwarder gone");
                        let _ = inner.exit_tx.send(Some(cause));
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = ?e, "polling forwarder child failed");
                    return;
                }
            }
        }
    });
}

struct ClashTraffic {
    inner: Arc<Inner>,
}

#[async_trait]
impl TrafficManager for ClashTraffic {
    async fn total(&self) -> Result<Traffic, Error> {
        let body = api_get(&self.inner, "connections").await?;
        Ok(Traffic {
            uplink_total: body.get("uploadTotal").and_then(Value::as_u64).unwrap_or_default(),
            downlink_total: body.get("downloadTotal").and_then(Value::as_u64).unwrap_or_default(),
        })
    }

    async fn connections(&self) -> Result<Vec<Connection>, Error> {
        let body = api_get(&self.inner, "connections").await?;
        let list = body.get("connections").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(list.iter().map(connection_from_clash).collect())
    }

    /// The clash surface only reports live flows; closed ones are not
    /// retained across the API.
    async fn closed_connections(&self) -> Result<Vec<Connection>, Error> {
        Ok(Vec::new())
    }

    async fn close(&self, ids: &[String]) -> Result<(), Error> {
        for id in ids {
            let url = self
                .inner
                .api
                .join(&format!("connections/{id}"))
                .map_err(|e| Error::Failed(format!("bad api path: {e}")))?;
            self.inner
                .client
                .delete(url)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn close_all(&self) -> Result<(), Error> {
        let url = self
            .inner
            .api
            .join("connections")
            .map_err(|e| Error::Failed(format!("bad api path: {e}")))?;
        self.inner
            .client
            .delete(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn connection_from_clash(raw: &Value) -> Connection {
    let metadata = raw.get("metadata").cloned().unwrap_or_default();
    let field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let chain: Vec<String> = raw
        .get("chains")
        .and_then(Value::as_array)
        .map(|c| c.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    Connection {
        id: field(raw, "id"),
        inbound: field(&metadata, "inboundName"),
        outbound: chain.first().cloned().unwrap_or_default(),
        chain,
        source: format!("{}:{}", field(&metadata, "sourceIP"), field(&metadata, "sourcePort")),
        destination: format!(
            "{}:{}",
            field(&metadata, "destinationIP"),
            field(&metadata, "destinationPort")
        ),
        uplink: raw.get("upload").and_then(Value::as_u64).unwrap_or_default(),
        downlink: raw.get("download").and_then(Value::as_u64).unwrap_or_default(),
    }
}

struct ClashOutbounds {
    inner: Arc<Inner>,
}

#[async_trait]
impl OutboundManager for ClashOutbounds {
    async fn outbounds(&self) -> Result<Vec<OutboundInfo>, Error> {
        let body = api_get(&self.inner, "proxies").await?;
        let Some(proxies) = body.get("proxies").and_then(Value::as_object) else {
            return Ok(Vec::new());
        };
        Ok(proxies.values().map(outbound_from_clash).collect())
    }

    async fn outbound(&self, tag: &str) -> Result<Option<OutboundInfo>, Error> {
        match api_get(&self.inner, &format!("proxies/{tag}")).await {
            Ok(body) => Ok(Some(outbound_from_clash(&body))),
            Err(Error::Request(e)) if e.status() == Some(reqwest::StatusCode::NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn select(&self, group_tag: &str, outbound_tag: &str) -> Result<(), Error> {
        let url = self
            .inner
            .api
            .join(&format!("proxies/{group_tag}"))
            .map_err(|e| Error::Failed(format!("bad api path: {e}")))?;
        let resp = self
            .inner
            .client
            .put(url)
            .json(&json!({"name": outbound_tag}))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Err(Error::GroupNotFound(group_tag.to_string())),
            reqwest::StatusCode::BAD_REQUEST => Err(Error::TagNotFound(outbound_tag.to_string())),
            s => Err(Error::Failed(format!("select returned {s}"))),
        }
    }
}

fn outbound_from_clash(raw: &Value) -> OutboundInfo {
    OutboundInfo {
        tag: raw.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        kind: raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_lowercase(),
        selected: raw.get("now").and_then(Value::as_str).map(str::to_string),
        children: raw
            .get("all")
            .and_then(Value::as_array)
            .map(|c| c.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clash_connection_maps_into_connection() {
        let raw = json!({
            "id": "c1",
            "upload": 120,
            "download": 4096,
            "chains": ["srv7", "user", "auto-all"],
            "metadata": {
                "inboundName": "tun-in",
                "sourceIP": "172.19.0.2",
                "sourcePort": "51322",
                "destinationIP": "93.184.216.34",
                "destinationPort": "443"
            }
        });
        let conn = connection_from_clash(&raw);
        assert_eq!(conn.id, "c1");
        assert_eq!(conn.outbound, "srv7");
        assert_eq!(conn.source, "172.19.0.2:51322");
        assert_eq!(conn.destination, "93.184.216.34:443");
        assert_eq!(conn.uplink, 120);
        assert_eq!(conn.downlink, 4096);
    }

    #[test]
    fn clash_proxy_maps_into_outbound_info() {
        let raw = json!({
            "name": "lantern",
            "type": "Selector",
            "now": "auto-lantern",
            "all": ["auto-lantern", "ss-nyc-1"]
        });
        let info = outbound_from_clash(&raw);
        assert_eq!(info.tag, "lantern");
        assert_eq!(info.kind, "selector");
        assert_eq!(info.selected.as_deref(), Some("auto-lantern"));
        assert!(info.is_group());
    }
}
