//! Rescue transport fabric for reaching the backend under censorship.
//!
//! A [`Kindling`] wraps a set of strategies (domain fronting, AMP cache
//! relay, DNS tunneling, proxyless smart dialing) behind one HTTP client.
//! Every request races the eligible strategies; the first response with a
//! status below 500 wins and cancels its siblings.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::event;
use crate::settings::Settings;
use crate::task;

pub mod amp;
pub mod dnstt;
pub mod fronted;
pub mod smart;

/// Local HTTP-CONNECT listener the routing table exposes as the
/// `kindling-proxy` outbound.
pub const PROXY_ADDRESS: &str = "127.0.0.1:14988";

/// Backoff for refetching discovery artifacts (front lists, AMP config).
pub(crate) fn backoff_expo_long_delay() -> backon::ExponentialBuilder {
    backon::ExponentialBuilder::new()
        .with_min_delay(Duration::from_secs(10))
        .with_max_delay(Duration::from_secs(60))
        .with_factor(2.0)
        .with_jitter()
}

/// Client-side ceiling for any single backend request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// a strategy that just failed is not retried before this elapses
const STRATEGY_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("no transport strategies configured")]
    NoStrategies,
    #[error("all transport strategies failed: [{causes}]")]
    Exhausted { causes: String },
    #[error("strategy does not apply to this request")]
    NotApplicable,
    #[error("payload too large for this transport")]
    PayloadTooLarge,
    #[error("no healthy dns tunnel available")]
    NoHealthyTunnel,
    #[error("request cancelled")]
    Cancelled,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn get(url: Url) -> Request {
        Request {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn post_json(url: Url, body: &impl Serialize) -> Result<Request, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        Ok(Request {
            method: Method::POST,
            url,
            headers,
            body: Bytes::from(serde_json::to_vec(body)?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// One rescue transport. Implementations swallow nothing: they return their
/// failure and the racing layer decides what it means.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn round_trip(&self, req: &Request) -> Result<Response, Error>;
    /// Releases background resources. Called once at shutdown.
    async fn shutdown(&self) {}
}

/// Emitted after the DNS-tunnel list has been hot-swapped into the client.
#[derive(Clone, Debug)]
pub struct ClientUpdated;

#[derive(Clone)]
pub struct Kindling {
    inner: Arc<Inner>,
}

struct Inner {
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
    cooldown_until: Mutex<HashMap<&'static str, Instant>>,
    cancel: CancellationToken,
    dnstt_subscription: Mutex<Option<event::Handle>>,
}

impl Kindling {
    /// Composes the full strategy set. Each strategy is optional: one whose
    /// configuration is absent or unparseable is left out.
    pub fn build(settings: &Settings, data_dir: &Path, tunnel_transport: Arc<dyn dnstt::TunnelTransport>) -> Kindling {
        let cancel = CancellationToken::new();
        let mut strategies: Vec<Arc<dyn Strategy>> = Vec::new();

        strategies.push(Arc::new(smart::SmartStrategy::new(smart::bootstrap_hosts(settings))));

        match fronted::FrontedStrategy::new(data_dir) {
            Ok(strategy) => strategies.push(Arc::new(strategy)),
            Err(e) => tracing::warn!(error = ?e, "domain fronting disabled"),
        }

        match amp::AmpStrategy::new(cancel.child_token()) {
            Ok(strategy) => strategies.push(Arc::new(strategy)),
            Err(e) => tracing::warn!(error = ?e, "amp relay disabled"),
        }

        let tunnels = dnstt::load_tunnels(data_dir);
        let pool = dnstt::Pool::new(
            tunnel_transport,
            tunnels,
            dnstt::ProbeOptions::default(),
            cancel.child_token(),
        );
        let dnstt_strategy = Arc::new(dnstt::DnsttStrategy::new(pool));
        strategies.push(dnstt_strategy.clone());

        let kindling = Kindling {
            inner: Arc::new(Inner {
                strategies: RwLock::new(strategies),
                cooldown_until: Mutex::new(HashMap::new()),
                cancel,
                dnstt_subscription: Mutex::new(None),
            }),
        };

        // hot-swap: a new tunnel list replaces the pool contents and the old
        // tunnels are closed asynchronously
        let handle = event::bus().subscribe::<dnstt::DnsttUpdated, _>(move |update| {
            tracing::info!(tunnels = update.tunnels.len(), "applying updated dns tunnel list");
            dnstt_strategy.replace_tunnels(update.tunnels);
            event::bus().emit(ClientUpdated);
        });
        *lock_ignore_poison(&kindling.inner.dnstt_subscription) = Some(handle);

        kindling
    }

    /// A client with a single direct strategy. Used by tests and by tools
    /// running where the network is not interfered with.
    pub fn direct() -> Kindling {
        Kindling::from_strategies(vec![Arc::new(DirectStrategy::new())])
    }

    pub fn from_strategies(strategies: Vec<Arc<dyn Strategy>>) -> Kindling {
        Kindling {
            inner: Arc::new(Inner {
                strategies: RwLock::new(strategies),
                cooldown_until: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                dnstt_subscription: Mutex::new(None),
            }),
        }
    }

    pub async fn get(&self, url: Url) -> Result<Response, Error> {
        self.send(Request::get(url)).await
    }

    pub async fn post_json(&self, url: Url, body: &impl Serialize) -> Result<Response, Error> {
        self.send(Request::post_json(url, body)?).await
    }

    /// Races all eligible strategies; first status < 500 wins, the winner
    /// cancels in-flight siblings. Individual strategy failures are logged
    /// and put that strategy on cooldown; only an exhausted request errors.
    pub async fn send(&self, req: Request) -> Result<Response, Error> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let strategies = self.eligible();
        if strategies.is_empty() {
            return Err(Error::NoStrategies);
        }

        let race = CancellationToken::new();
        let mut attempts = FuturesUnordered::new();
        for strategy in strategies {
            let strategy = strategy.clone();
            let req = req.clone();
            let race = race.clone();
            let shutdown = self.inner.cancel.clone();
            attempts.push(async move {
                let result = tokio::select! {
                    _ = race.cancelled() => Err(Error::Cancelled),
                    _ = shutdown.cancelled() => Err(Error::Cancelled),
                    result = strategy.round_trip(&req) => result,
                };
                (strategy.name(), result)
            });
        }

        let mut causes = Vec::new();
        while let Some((name, result)) = attempts.next().await {
            match result {
                Ok(resp) if resp.status.as_u16() < 500 => {
                    race.cancel();
                    self.clear_cooldown(name);
                    return Ok(resp);
                }
                Ok(resp) => {
                    tracing::debug!(strategy = name, status = %resp.status, "strategy returned server error");
                    self.set_cooldown(name);
                    causes.push(format!("{name}: status {}", resp.status));
                }
                Err(Error::Cancelled) => {}
                Err(Error::NotApplicable) => {}
                Err(e) => {
                    tracing::debug!(strategy = name, error = ?e, "strategy failed");
                    self.set_cooldown(name);
                    causes.push(format!("{name}: {e}"));
                }
            }
        }

        if causes.is_empty() {
            causes.push("no strategy attempted the request".to_string());
        }
        Err(Error::Exhausted {
            causes: causes.join("; "),
        })
    }

    /// Cancels pools and closes tunnels. The client is unusable afterwards.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(handle) = lock_ignore_poison(&self.inner.dnstt_subscription).take() {
            event::bus().unsubscribe(handle);
        }
        let strategies = self.strategies();
        task::spawn_guarded("kindling-shutdown", async move {
            for strategy in strategies {
                strategy.shutdown().await;
            }
        });
    }

    fn strategies(&self) -> Vec<Arc<dyn Strategy>> {
        match self.inner.strategies.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// All strategies not on cooldown; when everything is cooling down the
    /// full set races anyway rather than failing without an attempt.
    fn eligible(&self) -> Vec<Arc<dyn Strategy>> {
        let all = self.strategies();
        let now = Instant::now();
        let cooldowns = lock_ignore_poison(&self.inner.cooldown_until);
        let hot: Vec<Arc<dyn Strategy>> = all
            .iter()
            .filter(|s| cooldowns.get(s.name()).is_none_or(|until| *until <= now))
            .cloned()
            .collect();
        if hot.is_empty() { all } else { hot }
    }

    fn set_cooldown(&self, name: &'static str) {
        lock_ignore_poison(&self.inner.cooldown_until).insert(name, Instant::now() + STRATEGY_COOLDOWN);
    }

    fn clear_cooldown(&self, name: &'static str) {
        lock_ignore_poison(&self.inner.cooldown_until).remove(name);
    }
}

/// Plain reqwest pass-through.
pub struct DirectStrategy {
    client: reqwest::Client,
}

impl DirectStrategy {
    pub fn new() -> DirectStrategy {
        DirectStrategy {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for DirectStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for DirectStrategy {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        send_via(&self.client, req, None).await
    }
}

/// Issues `req` through `client`, optionally rewriting the URL host while
/// preserving the original `Host` header (domain fronting shape).
pub(crate) async fn send_via(client: &reqwest::Client, req: &Request, front_host: Option<&str>) -> Result<Response, Error> {
    let mut url = req.url.clone();
    let mut headers = req.headers.clone();
    if let Some(front) = front_host {
        let original_host = url.host_str().map(str::to_string);
        url.set_host(Some(front))?;
        if let Some(host) = original_host {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&host) {
                headers.insert(reqwest::header::HOST, value);
            }
        }
    }

    let resp = client
        .request(req.method.clone(), url)
        .headers(headers)
        .body(req.body.clone())
        .timeout(REQUEST_TIMEOUT)
        .send()
        .await?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await?;
    Ok(Response { status, headers, body })
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
