//! Proxyless smart dialer for the bootstrap hosts.
//!
//! Resolves the target and races plain TCP connects across every resolved
//! address; the request is then issued pinned to the winning address. Only
//! the discovery endpoints go through this strategy.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::net::TcpStream;

use std::io;
use std::net::SocketAddr;

use super::{Error, Request, Response, Strategy, send_via};
use crate::settings::Settings;

pub const DEFAULT_BOOTSTRAP_HOSTS: &[&str] = &[
    "config.getiantem.org",
    "api.getiantem.org",
    "globalconfig.flashlightproxy.net",
];

/// Settings key overriding the bootstrap host list.
pub const BOOTSTRAP_HOSTS_KEY: &str = "bootstrap_hosts";

pub fn bootstrap_hosts(settings: &Settings) -> Vec<String> {
    settings
        .get_string_slice(BOOTSTRAP_HOSTS_KEY)
        .filter(|hosts| !hosts.is_empty())
        .unwrap_or_else(|| DEFAULT_BOOTSTRAP_HOSTS.iter().map(|h| h.to_string()).collect())
}

pub struct SmartStrategy {
    hosts: Vec<String>,
}

impl SmartStrategy {
    pub fn new(hosts: Vec<String>) -> SmartStrategy {
        SmartStrategy { hosts }
    }
}

#[async_trait]
impl Strategy for SmartStrategy {
    fn name(&self) -> &'static str {
        "smart"
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        let host = req.url.host_str().ok_or(Error::NotApplicable)?;
        if !self.hosts.iter().any(|h| h == host) {
            return Err(Error::NotApplicable);
        }
        fetch_racing(req).await
    }
}

/// Issues `req` pinned to whichever resolved address accepts a TCP
/// connection first.
pub(crate) async fn fetch_racing(req: &Request) -> Result<Response, Error> {
    let host = req.url.host_str().ok_or(Error::NotApplicable)?.to_string();
    let port = req.url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port)).await?.collect();
    if addrs.is_empty() {
        return Err(Error::IO(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        )));
    }

    let winner = race_connect(&addrs).await?;
    let client = reqwest::Client::builder().resolve(&host, winner).build()?;
    send_via(&client, req, None).await
}

async fn race_connect(addrs: &[SocketAddr]) -> Result<SocketAddr, Error> {
    let mut attempts: FuturesUnordered<_> = addrs
        .iter()
        .map(|addr| {
            let addr = *addr;
            async move { TcpStream::connect(addr).await.map(|_| addr) }
        })
        .collect();

    let mut last_err = None;
    while let Some(result) = attempts.next().await {
        match result {
            Ok(addr) => return Ok(addr),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::IO(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no connect attempt ran")
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn race_prefers_a_listening_address() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let open = listener.local_addr()?;
        let closed: SocketAddr = "127.0.0.1:1".parse()?;

        let winner = race_connect(&[closed, open]).await?;
        assert_eq!(winner, open);
        Ok(())
    }

    #[tokio::test]
    async fn race_fails_when_nothing_listens() {
        let closed: SocketAddr = "127.0.0.1:1".parse().expect("addr");
        assert!(race_connect(&[closed]).await.is_err());
    }

    #[tokio::test]
    async fn non_bootstrap_hosts_are_not_applicable() {
        let strategy = SmartStrategy::new(vec!["config.getiantem.org".to_string()]);
        let req = Request::get(url::Url::parse("https://other.example.com/x").expect("url"));
        let err = strategy.round_trip(&req).await.expect_err("must not apply");
        assert!(matches!(err, Error::NotApplicable));
    }

    #[test]
    fn default_hosts_used_when_settings_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = Settings::init(dir.path())?;
        assert_eq!(bootstrap_hosts(&settings).len(), DEFAULT_BOOTSTRAP_HOSTS.len());

        settings.set(BOOTSTRAP_HOSTS_KEY, vec!["alt.example.org"])?;
        assert_eq!(bootstrap_hosts(&settings), vec!["alt.example.org".to_string()]);
        Ok(())
    }
}
