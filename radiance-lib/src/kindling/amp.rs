//! AMP cache relay strategy.
//!
//! A signed discovery config names the broker, the AMP cache and the front
//! hosts to present. Requests are relayed through the cache, dialed via the
//! bypass proxy so the relay leg escapes the tunnel routing. Payloads above
//! a few KiB skip this path, the relay is for small control requests only.

use async_trait::async_trait;
use backon::Retryable;
use flate2::read::GzDecoder;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use std::io::Read;
use std::sync::{Arc, RwLock};

use super::{Error, Request, Response, Strategy, send_via};
use crate::bypass;
use crate::task;

pub const CONFIG_URL: &str = "https://globalconfig.flashlightproxy.net/v1/amp.yaml.gz";
pub const CONFIG_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(12 * 60 * 60);

/// Requests larger than this skip the AMP path entirely.
pub const MAX_PAYLOAD: usize = 6 * 1024;

const TARGET_HEADER: &str = "x-amp-target";

#[derive(Clone, Debug, Deserialize)]
pub struct AmpConfig {
    pub broker_url: Url,
    pub cache_url: Url,
    pub public_key: String,
    #[serde(default)]
    pub fronts: Vec<String>,
}

pub struct AmpStrategy {
    proxied: reqwest::Client,
    direct: reqwest::Client,
    config: Arc<RwLock<Option<AmpConfig>>>,
}

impl AmpStrategy {
    pub fn new(cancel: CancellationToken) -> Result<AmpStrategy, Error> {
        let proxied = reqwest::Client::builder().proxy(bypass::proxy()?).build()?;
        let direct = reqwest::Client::new();
        let config = Arc::new(RwLock::new(None));

        spawn_config_poll(direct.clone(), config.clone(), cancel);

        Ok(AmpStrategy {
            proxied,
            direct,
            config,
        })
    }

    #[cfg(test)]
    fn with_config(config: AmpConfig) -> AmpStrategy {
        AmpStrategy {
            proxied: reqwest::Client::new(),
            direct: reqwest::Client::new(),
            config: Arc::new(RwLock::new(Some(config))),
        }
    }

    fn current_config(&self) -> Option<AmpConfig> {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn relay_request(&self, config: &AmpConfig, req: &Request) -> Result<Request, Error> {
        let mut relay = req.clone();
        relay.url = config.cache_url.join(req.url.path())?;
        if let Ok(value) = reqwest::header::HeaderValue::from_str(req.url.as_str()) {
            relay.headers.insert(TARGET_HEADER, value);
        }
        Ok(relay)
    }
}

#[async_trait]
impl Strategy for AmpStrategy {
    fn name(&self) -> &'static str {
        "amp"
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        if req.body.len() > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge);
        }
        let config = self.current_config().ok_or(Error::NotApplicable)?;
        let relay = self.relay_request(&config, req)?;
        let front = config.fronts.choose(&mut rand::rng()).map(String::as_str);

        match send_via(&self.proxied, &relay, front).await {
            Ok(resp) => Ok(resp),
            // bypass inbound down, try the relay leg without it
            Err(Error::Request(e)) if e.is_connect() => send_via(&self.direct, &relay, front).await,
            Err(e) => Err(e),
        }
    }
}

fn spawn_config_poll(client: reqwest::Client, config: Arc<RwLock<Option<AmpConfig>>>, cancel: CancellationToken) {
    task::spawn_guarded("amp-config-poll", async move {
        let url = match Url::parse(CONFIG_URL) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(error = ?e, "invalid amp config url");
                return;
            }
        };
        loop {
            let fetched = (|| fetch_config(&client, url.clone()))
                .retry(super::backoff_expo_long_delay())
                .await;
            match fetched {
                Ok(fetched) => {
                    let mut current = match config.write() {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    *current = Some(fetched);
                }
                Err(e) => tracing::debug!(error = ?e, "amp config fetch failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(CONFIG_POLL_INTERVAL) => {}
            }
        }
    });
}

async fn fetch_config(client: &reqwest::Client, url: Url) -> Result<AmpConfig, Error> {
    let resp = send_via(client, &Request::get(url), None).await?;
    if !resp.status.is_success() {
        return Err(Error::Exhausted {
            causes: format!("amp config fetch returned {}", resp.status),
        });
    }
    parse_config(&resp.body)
}

pub(crate) fn parse_config(gz_bytes: &[u8]) -> Result<AmpConfig, Error> {
    let mut yaml = String::new();
    GzDecoder::new(gz_bytes).read_to_string(&mut yaml)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config() -> AmpConfig {
        AmpConfig {
            broker_url: Url::parse("https://broker.example.net/").expect("url"),
            cache_url: Url::parse("https://amp-cache.example.org/").expect("url"),
            public_key: "9b7d".to_string(),
            fronts: vec!["front.example.com".to_string()],
        }
    }

    #[tokio::test]
    async fn oversized_payload_skips_the_relay() {
        let strategy = AmpStrategy::with_config(config());
        let mut req = Request::get(Url::parse("https://api.example.com/issue").expect("url"));
        req.body = Bytes::from(vec![0u8; MAX_PAYLOAD + 1]);

        let err = strategy.round_trip(&req).await.expect_err("payload too large");
        assert!(matches!(err, Error::PayloadTooLarge));
    }

    #[tokio::test]
    async fn missing_config_is_not_applicable() {
        let strategy = AmpStrategy {
            proxied: reqwest::Client::new(),
            direct: reqwest::Client::new(),
            config: Arc::new(RwLock::new(None)),
        };
        let req = Request::get(Url::parse("https://api.example.com/x").expect("url"));
        let err = strategy.round_trip(&req).await.expect_err("no config yet");
        assert!(matches!(err, Error::NotApplicable));
    }

    #[test]
    fn relay_request_targets_the_cache() -> anyhow::Result<()> {
        let strategy = AmpStrategy::with_config(config());
        let req = Request::get(Url::parse("https://api.example.com/v1/config")?);
        let relay = strategy.relay_request(&config(), &req)?;

        assert_eq!(relay.url.host_str(), Some("amp-cache.example.org"));
        assert_eq!(relay.url.path(), "/v1/config");
        assert_eq!(
            relay.headers.get(TARGET_HEADER).and_then(|v| v.to_str().ok()),
            Some("https://api.example.com/v1/config")
        );
        Ok(())
    }

    #[test]
    fn gzipped_config_parses() -> anyhow::Result<()> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let yaml = "broker_url: https://broker.example.net/\ncache_url: https://amp.example.org/\npublic_key: 9b7d\nfronts:\n  - front.example.com\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(yaml.as_bytes())?;
        let parsed = parse_config(&encoder.finish()?)?;

        assert_eq!(parsed.cache_url.host_str(), Some("amp.example.org"));
        assert_eq!(parsed.fronts, vec!["front.example.com".to_string()]);
        Ok(())
    }
}
