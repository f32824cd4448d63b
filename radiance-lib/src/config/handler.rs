//! Polling config fetcher.
//!
//! Loads the persisted config at start, then polls the backend through the
//! kindling fabric. New configs are merged into prior state, persisted, and
//! only then broadcast; transient failures keep the prior state.

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use super::{Config, ServerLocation};
use crate::event;
use crate::kindling::{self, Kindling};
use crate::settings::{self, Settings};
use crate::task;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const ENV_VAR_DISABLE_FETCH: &str = "RADIANCE_DISABLE_FETCH_CONFIG";
pub const DEFAULT_CONFIG_URL: &str = "https://api.getiantem.org/v1/config";

const APP_NAME: &str = "radiance";

/// Broadcast after a new config has been persisted and installed.
#[derive(Clone, Debug)]
pub struct ConfigUpdated {
    pub old: Option<Arc<Config>>,
    pub new: Arc<Config>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Poll {
    Default,
    Every(Duration),
    Disabled,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] kindling::Error),
    #[error("config error: {0}")]
    Config(#[from] super::Error),
    #[error("unexpected status: {0}")]
    UnexpectedStatus(StatusCode),
}

#[derive(Debug, Serialize)]
struct FetchRequest {
    #[serde(rename = "clientVersion")]
    client_version: String,
    platform: String,
    #[serde(rename = "appName")]
    app_name: String,
    #[serde(rename = "deviceID")]
    device_id: String,
    #[serde(rename = "userID")]
    user_id: String,
    #[serde(rename = "preferredLocation", skip_serializing_if = "Option::is_none")]
    preferred_location: Option<ServerLocation>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    last_modified: Option<u64>,
}

#[derive(Clone)]
pub struct Handler {
    inner: Arc<Inner>,
}

struct Inner {
    kindling: Kindling,
    url: Url,
    data_dir: PathBuf,
    settings: Settings,
    config: RwLock<Option<Arc<Config>>>,
    last_modified: Mutex<Option<u64>>,
    preferred: Mutex<Option<ServerLocation>>,
    refetch: tokio::sync::Notify,
    cancel: CancellationToken,
}

impl Handler {
    pub fn start(kindling: Kindling, settings: Settings, data_dir: PathBuf, url: Url, poll: Poll) -> Handler {
        let persisted = match super::load(&data_dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = ?e, "ignoring unreadable persisted config");
                None
            }
        };

        let handler = Handler {
            inner: Arc::new(Inner {
                kindling,
                url,
                data_dir,
                settings,
                config: RwLock::new(None),
                last_modified: Mutex::new(None),
                preferred: Mutex::new(None),
                refetch: tokio::sync::Notify::new(),
                cancel: CancellationToken::new(),
            }),
        };

        if let Some(config) = persisted {
            let installed = Arc::new(config);
            *write_guard(&handler.inner.config) = Some(installed.clone());
            event::bus().emit(ConfigUpdated {
                old: None,
                new: installed,
            });
        }

        let interval = match poll {
            Poll::Default => Some(DEFAULT_POLL_INTERVAL),
            Poll::Every(interval) => Some(interval),
            Poll::Disabled => None,
        };
        let fetch_disabled = std::env::var(ENV_VAR_DISABLE_FETCH).is_ok();
        match (interval, fetch_disabled) {
            (Some(interval), false) => {
                let inner = handler.inner.clone();
                task::spawn_guarded("config-poll", poll_loop(inner, interval));
            }
            _ => tracing::info!("config polling disabled"),
        }

        handler
    }

    /// Non-blocking; `None` until a config has been loaded or fetched.
    pub fn get_config(&self) -> Option<Arc<Config>> {
        read_guard(&self.inner.config).clone()
    }

    /// Updates the preference and triggers an out-of-band refetch.
    pub fn set_preferred_server_location(&self, country: &str, city: &str) {
        *lock(&self.inner.preferred) = Some(ServerLocation {
            country: country.to_string(),
            city: city.to_string(),
        });
        self.inner.refetch.notify_one();
    }

    /// `cb` runs on the event bus fan-out with `(old, new)` after every
    /// installed update; the handler never waits for it.
    pub fn add_config_listener(
        &self,
        cb: impl Fn(Option<Arc<Config>>, Arc<Config>) + Send + Sync + 'static,
    ) -> event::Handle {
        event::bus().subscribe::<ConfigUpdated, _>(move |update| cb(update.old, update.new))
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// One fetch round against the backend.
    pub async fn fetch_once(&self) -> Result<(), FetchError> {
        let body = self.fetch_request();
        let resp = self.inner.kindling.post_json(self.inner.url.clone(), &body).await?;
        match resp.status.as_u16() {
            // 206 is a partial update, same merge path
            200 | 206 => self.apply(&resp.body),
            204 | 304 => Ok(()),
            _ => Err(FetchError::UnexpectedStatus(resp.status)),
        }
    }

    fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            app_name: APP_NAME.to_string(),
            device_id: self.inner.settings.get_string(settings::DEVICE_ID).unwrap_or_default(),
            user_id: self.inner.settings.get_string(settings::USER_ID).unwrap_or_default(),
            preferred_location: lock(&self.inner.preferred).clone(),
            last_modified: *lock(&self.inner.last_modified),
        }
    }

    fn apply(&self, bytes: &[u8]) -> Result<(), FetchError> {
        let fetched = Config::parse(bytes)?;
        let old = read_guard(&self.inner.config).clone();
        let merged = match &old {
            Some(prior) => prior.merge(&fetched)?,
            None => fetched,
        };

        // persist first, then install, then notify
        super::persist(&self.inner.data_dir, &merged)?;
        let installed = Arc::new(merged);
        {
            let mut config = write_guard(&self.inner.config);
            *config = Some(installed.clone());
        }
        *lock(&self.inner.last_modified) = Some(unix_now());

        event::bus().emit(ConfigUpdated { old, new: installed });
        Ok(())
    }
}

async fn poll_loop(inner: Arc<Inner>, interval: Duration) {
    let handler = Handler { inner };
    loop {
        tokio::select! {
            _ = handler.inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
            _ = handler.inner.refetch.notified() => {}
        }
        match handler.fetch_once().await {
            Ok(_) => tracing::debug!("config poll round complete"),
            Err(e) => tracing::warn!(error = ?e, "config fetch failed, keeping prior configuration"),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn handler(dir: &std::path::Path) -> anyhow::Result<Handler> {
        let settings = Settings::init(dir)?;
        Ok(Handler::start(
            Kindling::direct(),
            settings,
            dir.to_path_buf(),
            Url::parse("https://config.example.com/v1/config")?,
            Poll::Disabled,
        ))
    }

    #[tokio::test]
    async fn apply_persists_installs_and_notifies() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = handler(dir.path())?;
        assert!(handler.get_config().is_none());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = handler.add_config_listener(move |old, new| {
            let _ = tx.send((old.is_none(), new.servers.clone()));
        });

        let body = json!({"servers": [{"country": "US", "city": "NYC"}]}).to_string();
        handler.apply(body.as_bytes())?;

        let config = handler.get_config().expect("config installed");
        assert_eq!(config.servers[0].city, "NYC");
        assert!(dir.path().join(super::super::FILE_NAME).exists());

        let (old_was_none, servers) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("listener fired");
        assert!(old_was_none);
        assert_eq!(servers[0].country, "US");

        event::bus().unsubscribe(listener);
        Ok(())
    }

    #[tokio::test]
    async fn apply_merges_into_prior_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = handler(dir.path())?;

        handler.apply(
            json!({
                "servers": [{"country": "US", "city": "NYC"}],
                "outbounds": [{"type": "shadowsocks", "tag": "ss-1"}]
            })
            .to_string()
            .as_bytes(),
        )?;
        handler.apply(json!({"servers": [{"country": "DE", "city": "Berlin"}]}).to_string().as_bytes())?;

        let config = handler.get_config().expect("config installed");
        assert_eq!(config.servers[0].city, "Berlin");
        // prior non-overridden field survives the merge
        assert_eq!(config.outbounds.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_body_keeps_prior_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = handler(dir.path())?;
        handler.apply(json!({"servers": [{"country": "US", "city": "NYC"}]}).to_string().as_bytes())?;

        assert!(handler.apply(b"{not json").is_err());
        let config = handler.get_config().expect("prior config intact");
        assert_eq!(config.servers[0].city, "NYC");
        Ok(())
    }

    #[tokio::test]
    async fn start_loads_persisted_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let handler = handler(dir.path())?;
            handler.apply(json!({"servers": [{"country": "IR", "city": "Tehran"}]}).to_string().as_bytes())?;
        }

        let reopened = handler(dir.path())?;
        let config = reopened.get_config().expect("persisted config loaded");
        assert_eq!(config.servers[0].city, "Tehran");
        Ok(())
    }

    #[tokio::test]
    async fn preferred_location_rides_the_next_request() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let handler = handler(dir.path())?;
        handler.set_preferred_server_location("NL", "Amsterdam");

        let body = handler.fetch_request();
        let serialized = serde_json::to_value(&body)?;
        assert_eq!(serialized["preferredLocation"]["city"], "Amsterdam");
        assert_eq!(serialized["appName"], "radiance");
        assert!(serialized["deviceID"].as_str().is_some_and(|id| !id.is_empty()));
        Ok(())
    }
}
