//! Domain-fronted HTTPS strategy.
//!
//! The front list is a versioned gzipped YAML published at a well-known URL;
//! a JSON cache survives restarts so fronting works before the first list
//! fetch succeeds. The list itself is bootstrapped through the smart dialer.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use url::Url;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::{fs, io};

use super::{Error, Request, Response, Strategy, send_via, smart};
use crate::dirs;

pub const LIST_URL: &str = "https://globalconfig.flashlightproxy.net/v1/fronted.yaml.gz";
pub const CACHE_FILE: &str = "fronted_cache.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Front {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FrontList {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub fronts: Vec<Front>,
}

pub struct FrontedStrategy {
    client: reqwest::Client,
    cache_path: PathBuf,
    list: RwLock<FrontList>,
    // a single in-flight bootstrap fetch at a time
    fetch_lock: tokio::sync::Mutex<()>,
}

impl FrontedStrategy {
    pub fn new(data_dir: &Path) -> Result<FrontedStrategy, Error> {
        let cache_path = data_dir.join(CACHE_FILE);
        let list = match load_cache(&cache_path) {
            Ok(Some(list)) => list,
            Ok(None) => FrontList::default(),
            Err(e) => {
                tracing::warn!(error = ?e, "ignoring unreadable front cache");
                FrontList::default()
            }
        };
        Ok(FrontedStrategy {
            client: reqwest::Client::builder().build()?,
            cache_path,
            list: RwLock::new(list),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn ensure_fronts(&self) -> Result<(), Error> {
        if !self.fronts().is_empty() {
            return Ok(());
        }
        let _fetching = self.fetch_lock.lock().await;
        if !self.fronts().is_empty() {
            return Ok(());
        }

        let url = Url::parse(LIST_URL)?;
        let resp = smart::fetch_racing(&Request::get(url)).await?;
        if !resp.status.is_success() {
            return Err(Error::Exhausted {
                causes: format!("front list fetch returned {}", resp.status),
            });
        }
        let list = parse_list(&resp.body)?;
        if list.fronts.is_empty() {
            return Err(Error::NoStrategies);
        }
        if let Err(e) = persist_cache(&self.cache_path, &list) {
            tracing::warn!(error = ?e, "failed caching front list");
        }
        self.install(list);
        Ok(())
    }

    /// Replaces the current list when `list` carries a newer version.
    pub fn install(&self, list: FrontList) {
        let mut current = match self.list.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.version <= list.version || current.fronts.is_empty() {
            *current = list;
        }
    }

    fn fronts(&self) -> Vec<Front> {
        match self.list.read() {
            Ok(guard) => guard.fronts.clone(),
            Err(poisoned) => poisoned.into_inner().fronts.clone(),
        }
    }
}

#[async_trait]
impl Strategy for FrontedStrategy {
    fn name(&self) -> &'static str {
        "fronted"
    }

    async fn round_trip(&self, req: &Request) -> Result<Response, Error> {
        self.ensure_fronts().await?;
        let fronts = self.fronts();
        let front = fronts.choose(&mut rand::rng()).ok_or(Error::NoStrategies)?;
        send_via(&self.client, req, Some(&front.domain)).await
    }
}

fn load_cache(path: &Path) -> Result<Option<FrontList>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::IO(e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

fn persist_cache(path: &Path, list: &FrontList) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(list)?;
    dirs::write_atomic(path, &bytes, 0o644)?;
    Ok(())
}

pub(crate) fn parse_list(gz_bytes: &[u8]) -> Result<FrontList, Error> {
    let mut yaml = String::new();
    GzDecoder::new(gz_bytes).read_to_string(&mut yaml)?;
    Ok(serde_yaml::from_str(&yaml)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(version: u32, domains: &[&str]) -> FrontList {
        FrontList {
            version,
            fronts: domains
                .iter()
                .map(|d| Front {
                    domain: d.to_string(),
                    provider: None,
                })
                .collect(),
        }
    }

    #[test]
    fn cache_survives_restart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CACHE_FILE);
        persist_cache(&path, &list(3, &["cdn.front.example"]))?;

        let loaded = load_cache(&path)?.expect("cache must load");
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.fronts[0].domain, "cdn.front.example");
        Ok(())
    }

    #[test]
    fn install_keeps_newer_version() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let strategy = FrontedStrategy::new(dir.path())?;
        strategy.install(list(5, &["a.example"]));
        strategy.install(list(2, &["b.example"]));

        assert_eq!(strategy.fronts()[0].domain, "a.example");
        Ok(())
    }

    #[test]
    fn gzipped_list_parses() -> anyhow::Result<()> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let yaml = "version: 4\nfronts:\n  - domain: cdn.front.example\n    provider: akamai\n";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(yaml.as_bytes())?;
        let parsed = parse_list(&encoder.finish()?)?;

        assert_eq!(parsed.version, 4);
        assert_eq!(parsed.fronts[0].provider.as_deref(), Some("akamai"));
        Ok(())
    }
}
