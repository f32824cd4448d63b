//! DNS-tunnel candidate pool.
//!
//! Candidates come from an embedded list, optionally overridden by a live
//! list delivered through the fabric itself. A background prober keeps a
//! small channel of known-working tunnels filled; requests consume from that
//! channel and give the tunnel back only when it worked.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::{Error, Request, Response, Strategy, send_via};
use crate::event;
use crate::task;

pub const PROBE_URL: &str = "https://www.gstatic.com/generate_204";
pub const LIST_FILE: &str = "dnstt.yml.gz";
pub const LIST_URL: &str = "https://globalconfig.flashlightproxy.net/v1/dnstt.yml.gz";
pub const LIST_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const EMBEDDED_TUNNELS: &str = include_str!("dnstt_default.yml");

// healthy tunnels kept ready for consumers
const HEALTHY_CAPACITY: usize = 2;
// a consumer waits for a healthy candidate at most this many times
const ACQUIRE_RETRIES: usize = 6;

#[derive(Clone, Debug)]
pub struct ProbeOptions {
    pub interval: Duration,
    pub deadline: Duration,
    pub concurrency: usize,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            interval: Duration::from_secs(60),
            deadline: Duration::from_secs(30),
            concurrency: 10,
        }
    }
}

/// One DNS-tunnel endpoint as delivered in the discovery list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub domain: String,
    pub public_key: String,
    pub resolver: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TunnelList {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Emitted when the server delivered a newer tunnel list.
#[derive(Clone, Debug)]
pub struct DnsttUpdated {
    pub tunnels: Vec<TunnelConfig>,
}

/// The wire codec carrying HTTP through a tunnel. The encapsulation itself
/// is an external collaborator; this seam is all the pool needs.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn round_trip(&self, tunnel: &TunnelConfig, req: &Request) -> Result<Response, Error>;
    async fn close(&self, _tunnel: &TunnelConfig) {}
}

struct Healthy {
    tunnel: TunnelConfig,
    #[allow(dead_code)]
    last_succeeded: Instant,
}

#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    transport: Arc<dyn TunnelTransport>,
    candidates: RwLock<Vec<TunnelConfig>>,
    healthy_tx: mpsc::Sender<Healthy>,
    healthy_rx: tokio::sync::Mutex<mpsc::Receiver<Healthy>>,
    options: ProbeOptions,
    cancel: CancellationToken,
}

impl Pool {
    pub fn new(
        transport: Arc<dyn TunnelTransport>,
        tunnels: Vec<TunnelConfig>,
        options: ProbeOptions,
        cancel: CancellationToken,
    ) -> Pool {
        let (healthy_tx, healthy_rx) = mpsc::channel(HEALTHY_CAPACITY);
        let inner = Arc::new(PoolInner {
            transport,
            candidates: RwLock::new(tunnels),
            healthy_tx,
            healthy_rx: tokio::sync::Mutex::new(healthy_rx),
            options,
            cancel,
        });
        task::spawn_guarded("dnstt-probe", probe_loop(inner.clone()));
        Pool { inner }
    }

    /// Sends `req` through a healthy tunnel. A tunnel that fails the request
    /// is evicted and closed; it only comes back once probing clears it.
    pub async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        let tunnel = self.acquire().await?;
        match self.inner.transport.round_trip(&tunnel, req).await {
            Ok(resp) => {
                self.reinstate(tunnel);
                Ok(resp)
            }
            Err(e) => {
                self.evict(tunnel);
                Err(e)
            }
        }
    }

    /// Blocks until a healthy candidate is available, giving up after a
    /// bounded number of waits.
    async fn acquire(&self) -> Result<TunnelConfig, Error> {
        let mut rx = self.inner.healthy_rx.lock().await;
        for _ in 0..ACQUIRE_RETRIES {
            let received = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Err(Error::Cancelled),
                received = tokio::time::timeout(self.inner.options.deadline, rx.recv()) => received,
            };
            match received {
                // skip entries that no longer belong to the candidate list
                Ok(Some(healthy)) if self.is_candidate(&healthy.tunnel) => return Ok(healthy.tunnel),
                Ok(Some(_)) => {}
                Ok(None) => return Err(Error::NoHealthyTunnel),
                Err(_elapsed) => {}
            }
        }
        Err(Error::NoHealthyTunnel)
    }

    fn reinstate(&self, tunnel: TunnelConfig) {
        if !self.is_candidate(&tunnel) {
            return;
        }
        // a full channel means enough healthy tunnels are queued already
        let _ = self.inner.healthy_tx.try_send(Healthy {
            tunnel,
            last_succeeded: Instant::now(),
        });
    }

    fn evict(&self, tunnel: TunnelConfig) {
        tracing::debug!(domain = %tunnel.domain, "evicting dns tunnel after failed request");
        let transport = self.inner.transport.clone();
        task::spawn_guarded("dnstt-evict", async move {
            transport.close(&tunnel).await;
        });
    }

    /// Installs a new candidate list; tunnels that fell out of it are closed
    /// asynchronously.
    pub fn replace(&self, tunnels: Vec<TunnelConfig>) {
        let removed: Vec<TunnelConfig> = {
            let mut candidates = write_guard(&self.inner.candidates);
            let old = std::mem::replace(&mut *candidates, tunnels.clone());
            old.into_iter().filter(|t| !tunnels.contains(t)).collect()
        };
        if removed.is_empty() {
            return;
        }
        let transport = self.inner.transport.clone();
        task::spawn_guarded("dnstt-replace", async move {
            for tunnel in removed {
                transport.close(&tunnel).await;
            }
        });
    }

    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let candidates = read_guard(&self.inner.candidates).clone();
        for tunnel in candidates {
            self.inner.transport.close(&tunnel).await;
        }
    }

    fn is_candidate(&self, tunnel: &TunnelConfig) -> bool {
        read_guard(&self.inner.candidates).contains(tunnel)
    }
}

async fn probe_loop(inner: Arc<PoolInner>) {
    loop {
        probe_round(&inner).await;
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.options.interval) => {}
        }
    }
}

async fn probe_round(inner: &Arc<PoolInner>) {
    let candidates = read_guard(&inner.candidates).clone();
    if candidates.is_empty() {
        return;
    }
    let probe_url = Url::parse(PROBE_URL).unwrap_or_else(|e| panic!("probe url must parse: {e}"));
    let req = Request::get(probe_url);

    stream::iter(candidates)
        .for_each_concurrent(inner.options.concurrency, |tunnel| {
            let inner = inner.clone();
            let req = req.clone();
            async move {
                if inner.cancel.is_cancelled() {
                    return;
                }
                let probed = tokio::time::timeout(inner.options.deadline, inner.transport.round_trip(&tunnel, &req)).await;
                match probed {
                    Ok(Ok(resp)) if resp.status.is_success() => {
                        let _ = inner.healthy_tx.try_send(Healthy {
                            tunnel,
                            last_succeeded: Instant::now(),
                        });
                    }
                    Ok(Ok(resp)) => {
                        tracing::debug!(domain = %tunnel.domain, status = %resp.status, "dns tunnel probe rejected");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(domain = %tunnel.domain, error = ?e, "dns tunnel probe failed");
                    }
                    Err(_elapsed) => {
                        tracing::debug!(domain = %tunnel.domain, "dns tunnel probe timed out");
                    }
                }
            }
        })
        .await;
}

pub struct DnsttStrategy {
    pool: Pool,
}

impl DnsttStrategy {
    pub fn new(pool: Pool) -> DnsttStrategy {
        DnsttStrategy { pool }
    }

    pub fn replace_tunnels(&self, tunnels: Vec<TunnelConfig>) {
        self.pool.replace(tunnels);
    }
}

#[async_trait]
impl Strategy for DnsttStrategy {
    fn name(&self) -> &'static str {
        "dnstt"
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        self.pool.round_trip(req).await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Default carrier: TLS to the candidate's resolver address with the tunnel
/// domain as SNI. The DNS encapsulation proper lives in the linked codec.
pub struct HttpsCarrier {
    clients: Mutex<HashMap<TunnelConfig, reqwest::Client>>,
}

impl HttpsCarrier {
    pub fn new() -> HttpsCarrier {
        HttpsCarrier {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, tunnel: &TunnelConfig) -> Result<reqwest::Client, Error> {
        let mut clients = lock(&self.clients);
        if let Some(client) = clients.get(tunnel) {
            return Ok(client.clone());
        }
        let addr = resolver_addr(&tunnel.resolver)?;
        let client = reqwest::Client::builder()
            .resolve(&tunnel.domain, addr)
            .build()?;
        clients.insert(tunnel.clone(), client.clone());
        Ok(client)
    }
}

impl Default for HttpsCarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelTransport for HttpsCarrier {
    async fn round_trip(&self, tunnel: &TunnelConfig, req: &Request) -> Result<Response, Error> {
        let client = self.client(tunnel)?;
        send_via(&client, req, Some(&tunnel.domain)).await
    }

    async fn close(&self, tunnel: &TunnelConfig) {
        lock(&self.clients).remove(tunnel);
    }
}

fn resolver_addr(resolver: &str) -> Result<SocketAddr, Error> {
    if let Ok(addr) = resolver.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: std::net::IpAddr = resolver
        .parse()
        .map_err(|_| Error::IO(std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("bad resolver: {resolver}"))))?;
    Ok(SocketAddr::new(ip, 443))
}

/// Tunnels compiled into the binary; a parse failure here is a build bug.
pub fn embedded_tunnels() -> Vec<TunnelConfig> {
    let list: TunnelList =
        serde_yaml::from_str(EMBEDDED_TUNNELS).unwrap_or_else(|e| panic!("embedded dnstt list must parse: {e}"));
    list.tunnels
}

/// The embedded list, overridden by a previously downloaded live list.
pub fn load_tunnels(data_dir: &Path) -> Vec<TunnelConfig> {
    match read_list_file(&data_dir.join(LIST_FILE)) {
        Ok(Some(list)) if !list.tunnels.is_empty() => list.tunnels,
        Ok(_) => embedded_tunnels(),
        Err(e) => {
            tracing::warn!(error = ?e, "ignoring unreadable dns tunnel list");
            embedded_tunnels()
        }
    }
}

fn read_list_file(path: &Path) -> Result<Option<TunnelList>, Error> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::IO(e)),
    };
    Ok(Some(parse_list(&bytes)?))
}

pub(crate) fn parse_list(gz_bytes: &[u8]) -> Result<TunnelList, Error> {
    let mut yaml = String::new();
    GzDecoder::new(gz_bytes).read_to_string(&mut yaml)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

/// Polls the live tunnel list through the fabric itself and emits
/// [`DnsttUpdated`] when the server delivered a newer version.
pub fn spawn_refresh(kindling: super::Kindling, data_dir: PathBuf, cancel: CancellationToken) {
    task::spawn_guarded("dnstt-refresh", async move {
        let url = match Url::parse(LIST_URL) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = ?e, "invalid dnstt list url");
                return;
            }
        };
        let mut current_version = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(LIST_REFRESH_INTERVAL) => {}
            }
            match kindling.get(url.clone()).await {
                Ok(resp) if resp.status.is_success() => match parse_list(&resp.body) {
                    Ok(list) if list.version > current_version && !list.tunnels.is_empty() => {
                        current_version = list.version;
                        if let Err(e) = crate::dirs::write_atomic(&data_dir.join(LIST_FILE), &resp.body, 0o644) {
                            tracing::warn!(error = ?e, "failed persisting dns tunnel list");
                        }
                        event::bus().emit(DnsttUpdated { tunnels: list.tunnels });
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = ?e, "ignoring malformed dns tunnel list"),
                },
                Ok(resp) => tracing::debug!(status = %resp.status, "dns tunnel list fetch rejected"),
                Err(e) => tracing::debug!(error = ?e, "dns tunnel list fetch failed"),
            }
        }
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_guard<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
