//! Tunnel lifecycle: build options, drive the packet forwarder, own the
//! cache file, broadcast status transitions.

use thiserror::Error;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::event;
use crate::options::builder::{self, Builder, PreferredGroup};
use crate::options::{MODE_AUTO, MODE_LANTERN, MODE_USER, TAG_AUTO_ALL, TAG_AUTO_LANTERN, TAG_AUTO_USER, TAG_LANTERN, TAG_USER};
use crate::server;
use crate::settings::Settings;
use crate::status::{Status, StatusUpdate};
use crate::task;

pub mod cache;
pub mod forwarder;
pub mod mock;
pub mod process;

pub use forwarder::{Connection, OutboundInfo, PacketForwarder, Traffic};

const STOP_DEADLINE: Duration = Duration::from_secs(30);
const WALK_DEPTH_LIMIT: usize = 16;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tunnel is not connected")]
    NotConnected,
    #[error("unknown outbound group: {0}")]
    UnknownGroup(String),
    #[error("outbound {tag} is not in group {group}")]
    TagNotInGroup { group: String, tag: String },
    #[error("options error: {0}")]
    Options(#[from] builder::Error),
    #[error("forwarder error: {0}")]
    Forwarder(#[from] forwarder::Error),
    #[error("cache error: {0}")]
    Cache(#[from] cache::Error),
}

#[derive(Clone)]
pub struct TunnelService {
    inner: Arc<Inner>,
}

struct Inner {
    forwarder: Arc<dyn PacketForwarder>,
    data_dir: PathBuf,
    settings: Settings,
    servers: server::Manager,
    bus: &'static event::Bus,
    // mutating operations serialize here; status reads stay lock-free
    op_lock: tokio::sync::Mutex<()>,
    status: AtomicU8,
    last_cause: Mutex<Option<String>>,
    cache: Mutex<Option<cache::CacheFile>>,
}

impl TunnelService {
    pub fn new(
        forwarder: Arc<dyn PacketForwarder>,
        data_dir: PathBuf,
        settings: Settings,
        servers: server::Manager,
    ) -> TunnelService {
        Self::with_bus(forwarder, data_dir, settings, servers, event::bus())
    }

    pub fn with_bus(
        forwarder: Arc<dyn PacketForwarder>,
        data_dir: PathBuf,
        settings: Settings,
        servers: server::Manager,
        bus: &'static event::Bus,
    ) -> TunnelService {
        let service = TunnelService {
            inner: Arc::new(Inner {
                forwarder,
                data_dir,
                settings,
                servers,
                bus,
                op_lock: tokio::sync::Mutex::new(()),
                status: AtomicU8::new(Status::Disconnected.as_u8()),
                last_cause: Mutex::new(None),
                cache: Mutex::new(None),
            }),
        };
        service.spawn_exit_watch();
        service
    }

    pub(crate) fn bus(&self) -> &'static event::Bus {
        self.inner.bus
    }

    /// Lock-free status snapshot.
    pub fn status(&self) -> Status {
        Status::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    pub fn last_cause(&self) -> Option<String> {
        lock(&self.inner.last_cause).clone()
    }

    pub async fn start(&self, group: Option<PreferredGroup>, tag: Option<&str>) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        self.do_start(group.unwrap_or(PreferredGroup::All), tag, None).await
    }

    /// Starts with a caller-supplied options graph instead of building one.
    pub async fn start_with_options(&self, options: crate::options::Options) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        self.do_start(PreferredGroup::All, None, Some(options)).await
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        self.do_stop().await
    }

    /// Stops and starts again with the selection captured from the cache.
    /// Only valid while connected.
    pub async fn restart(&self) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        if self.status() != Status::Connected {
            return Err(Error::NotConnected);
        }

        let (mode, selected) = {
            let cache = lock(&self.inner.cache);
            let record = cache.as_ref().map(|c| c.record().clone()).unwrap_or_default();
            let mode = record.mode.clone().unwrap_or_else(|| MODE_AUTO.to_string());
            let selected = record.selected.get(mode_root(&mode)).cloned();
            (mode, selected)
        };

        self.do_stop().await?;
        let group = mode.parse().unwrap_or(PreferredGroup::All);
        self.do_start(group, selected.as_deref(), None).await
    }

    async fn do_start(
        &self,
        group: PreferredGroup,
        tag: Option<&str>,
        options: Option<crate::options::Options>,
    ) -> Result<(), Error> {
        if self.status() == Status::Connected {
            return Ok(());
        }
        self.set_status(Status::Connecting, None);

        let started = self.start_forwarder(group, tag, options).await;
        match started {
            Ok(_) => {
                self.set_status(Status::Connected, None);
                Ok(())
            }
            Err(e) => {
                self.close_cache();
                self.set_status(Status::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn start_forwarder(
        &self,
        group: PreferredGroup,
        tag: Option<&str>,
        options: Option<crate::options::Options>,
    ) -> Result<(), Error> {
        let options = match options {
            Some(options) => options,
            None => Builder::new(&self.inner.data_dir, group, &self.inner.settings, &self.inner.servers).build()?,
        };

        let cache_path = self.inner.data_dir.join(builder::CACHE_FILE);
        let mut cache_file = cache::CacheFile::open(&cache_path)?;
        cache_file.set_mode(group.as_mode())?;
        *lock(&self.inner.cache) = Some(cache_file);

        self.inner.forwarder.start(options).await?;
        self.inner.forwarder.set_mode(group.as_mode()).await?;

        if let Some(tag) = tag {
            let group_tag = mode_root(group.as_mode());
            if group_tag != TAG_AUTO_ALL {
                self.inner.forwarder.outbounds().select(group_tag, tag).await?;
                if let Some(cache) = lock(&self.inner.cache).as_mut() {
                    cache.set_selected(group_tag, tag)?;
                }
            }
        }
        Ok(())
    }

    async fn do_stop(&self) -> Result<(), Error> {
        if self.status() == Status::Disconnected {
            return Ok(());
        }
        self.set_status(Status::Disconnecting, None);

        match tokio::time::timeout(STOP_DEADLINE, self.inner.forwarder.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = ?e, "forwarder close failed"),
            Err(_) => tracing::warn!("forwarder close exceeded deadline"),
        }

        self.close_cache();
        self.set_status(Status::Disconnected, None);
        Ok(())
    }

    /// Moves the selection of `group` to `tag`. When `group` differs from
    /// the active clash mode the mode follows and existing connections are
    /// closed so routes re-evaluate.
    pub async fn select_outbound(&self, group: &str, tag: &str) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        if self.status() != Status::Connected {
            return Err(Error::NotConnected);
        }
        let group_tag = match group {
            MODE_LANTERN => TAG_LANTERN,
            MODE_USER => TAG_USER,
            other => return Err(Error::UnknownGroup(other.to_string())),
        };

        let outbounds = self.inner.forwarder.outbounds();
        let info = outbounds
            .outbound(group_tag)
            .await?
            .ok_or_else(|| Error::UnknownGroup(group.to_string()))?;
        if !info.children.iter().any(|c| c == tag) {
            return Err(Error::TagNotInGroup {
                group: group.to_string(),
                tag: tag.to_string(),
            });
        }

        outbounds.select(group_tag, tag).await?;

        let current_mode = self.clash_mode();
        if current_mode != group {
            self.inner.forwarder.set_mode(group).await?;
            self.inner.forwarder.traffic().close_all().await?;
            if let Some(cache) = lock(&self.inner.cache).as_mut() {
                cache.set_mode(group)?;
            }
        }
        if let Some(cache) = lock(&self.inner.cache).as_mut() {
            cache.set_selected(group_tag, tag)?;
        }
        Ok(())
    }

    pub async fn set_clash_mode(&self, mode: &str) -> Result<(), Error> {
        let _op = self.inner.op_lock.lock().await;
        if !matches!(mode, MODE_AUTO | MODE_LANTERN | MODE_USER) {
            return Err(Error::UnknownGroup(mode.to_string()));
        }
        if self.status() != Status::Connected {
            return Err(Error::NotConnected);
        }
        self.inner.forwarder.set_mode(mode).await?;
        if let Some(cache) = lock(&self.inner.cache).as_mut() {
            cache.set_mode(mode)?;
        }
        Ok(())
    }

    /// The active clash mode; read from the cache record, which follows the
    /// forwarder, or from disk while the tunnel is down.
    pub fn clash_mode(&self) -> String {
        let record = {
            let cache = lock(&self.inner.cache);
            match cache.as_ref() {
                Some(cache) => Some(cache.record().clone()),
                None => cache::CacheFile::peek(&self.inner.data_dir.join(builder::CACHE_FILE)).ok(),
            }
        };
        record
            .and_then(|r| r.mode)
            .unwrap_or_else(|| MODE_AUTO.to_string())
    }

    /// The user-selected group and outbound, falling back to the persisted
    /// cache when the tunnel is down.
    pub fn get_selected(&self) -> (String, String) {
        let mode = self.clash_mode();
        let group_tag = mode_root(&mode).to_string();
        let record = {
            let cache = lock(&self.inner.cache);
            match cache.as_ref() {
                Some(cache) => Some(cache.record().clone()),
                None => cache::CacheFile::peek(&self.inner.data_dir.join(builder::CACHE_FILE)).ok(),
            }
        };
        let tag = record
            .and_then(|r| r.selected.get(&group_tag).cloned())
            .unwrap_or_else(|| default_selection(&mode).to_string());
        (group_tag, tag)
    }

    /// Walks the selector/URL-test tree from the active mode's root down to
    /// the concrete leaf.
    pub async fn get_active(&self) -> Result<(String, String), Error> {
        if self.status() != Status::Connected {
            return Err(Error::NotConnected);
        }
        let root = mode_root(&self.clash_mode()).to_string();
        let outbounds = self.inner.forwarder.outbounds();

        let mut tag = root.clone();
        for _ in 0..WALK_DEPTH_LIMIT {
            let Some(info) = outbounds.outbound(&tag).await? else {
                return Err(Error::TagNotInGroup {
                    group: root,
                    tag,
                });
            };
            match info.selected {
                Some(next) => tag = next,
                None if info.is_group() => tag = info.children[0].clone(),
                None => return Ok((root, tag)),
            }
        }
        Ok((root, tag))
    }

    pub async fn groups(&self) -> Result<Vec<OutboundInfo>, Error> {
        let all = self.inner.forwarder.outbounds().outbounds().await?;
        Ok(all.into_iter().filter(|o| o.is_group()).collect())
    }

    pub async fn connections(&self) -> Result<Vec<Connection>, Error> {
        Ok(self.inner.forwarder.traffic().connections().await?)
    }

    pub async fn close_connections(&self, ids: &[String]) -> Result<(), Error> {
        Ok(self.inner.forwarder.traffic().close(ids).await?)
    }

    pub async fn traffic_total(&self) -> Result<Traffic, Error> {
        Ok(self.inner.forwarder.traffic().total().await?)
    }

    /// Marks the tunnel failed from the outside (e.g. the control plane
    /// going away) and broadcasts the transition.
    pub fn report_error(&self, cause: &str) {
        self.set_status(Status::Error, Some(cause.to_string()));
    }

    /// Stops everything; used at process shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            tracing::warn!(error = ?e, "tunnel stop during shutdown failed");
        }
    }

    fn spawn_exit_watch(&self) {
        let inner = self.inner.clone();
        let mut watch = self.inner.forwarder.exit_watch();
        task::spawn_guarded("forwarder-exit-watch", async move {
            while watch.changed().await.is_ok() {
                let cause = watch.borrow_and_update().clone();
                let Some(cause) = cause else { continue };
                let service = TunnelService { inner: inner.clone() };
                let status = service.status();
                if status == Status::Connected || status == Status::Connecting {
                    tracing::error!(%cause, "forwarder exited unexpectedly");
                    service.close_cache();
                    service.set_status(Status::Error, Some(cause));
                }
            }
        });
    }

    fn close_cache(&self) {
        if let Some(cache) = lock(&self.inner.cache).take() {
            if let Err(e) = cache.close() {
                tracing::warn!(error = ?e, "closing cache file failed");
            }
        }
    }

    fn set_status(&self, status: Status, cause: Option<String>) {
        self.inner.status.store(status.as_u8(), Ordering::SeqCst);
        *lock(&self.inner.last_cause) = cause.clone();
        self.inner.bus.emit(StatusUpdate { status, cause });
    }
}

fn mode_root(mode: &str) -> &'static str {
    match mode {
        MODE_LANTERN => TAG_LANTERN,
        MODE_USER => TAG_USER,
        _ => TAG_AUTO_ALL,
    }
}

fn default_selection(mode: &str) -> &'static str {
    match mode {
        MODE_LANTERN => TAG_AUTO_LANTERN,
        MODE_USER => TAG_AUTO_USER,
        _ => TAG_AUTO_ALL,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::server::Group;
    use crate::tunnel::mock::MockForwarder;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        service: TunnelService,
        forwarder: MockForwarder,
        bus: &'static event::Bus,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(config::FILE_NAME),
            json!({
                "outbounds": [{"type": "shadowsocks", "tag": "ss-nyc-1", "server": "203.0.113.1"}]
            })
            .to_string(),
        )
        .expect("write config");

        let settings = Settings::init(dir.path()).expect("settings");
        let servers = server::Manager::open(dir.path()).expect("servers");
        servers
            .add_servers(
                Group::User,
                vec![server::Server {
                    group: Group::User,
                    tag: "srv7".to_string(),
                    kind: "hysteria2".to_string(),
                    options: serde_json::Map::new(),
                    location: None,
                }],
            )
            .expect("seed user server");

        let forwarder = MockForwarder::new();
        let bus: &'static event::Bus = Box::leak(Box::new(event::Bus::default()));
        let service = TunnelService::with_bus(
            Arc::new(forwarder.clone()),
            dir.path().to_path_buf(),
            settings,
            servers,
            bus,
        );
        Fixture {
            _dir: dir,
            service,
            forwarder,
            bus,
        }
    }

    fn watch_status(bus: &'static event::Bus) -> mpsc::UnboundedReceiver<Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe::<StatusUpdate, _>(move |update| {
            let _ = tx.send(update.status);
        });
        rx
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Status>, n: usize) -> Vec<Status> {
        let mut out = Vec::new();
        for _ in 0..n {
            let status = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("status update timed out")
                .expect("bus closed");
            out.push(status);
        }
        out
    }

    #[tokio::test]
    async fn start_stop_start_keeps_listeners_informed() -> anyhow::Result<()> {
        let fixture = fixture();
        let mut statuses = watch_status(fixture.bus);

        fixture.service.start(None, None).await?;
        assert_eq!(fixture.service.status(), Status::Connected);

        fixture.service.stop().await?;
        assert_eq!(fixture.service.status(), Status::Disconnected);

        fixture.service.start(None, None).await?;
        assert_eq!(fixture.service.status(), Status::Connected);

        assert_eq!(
            drain(&mut statuses, 6).await,
            vec![
                Status::Connecting,
                Status::Connected,
                Status::Disconnecting,
                Status::Disconnected,
                Status::Connecting,
                Status::Connected,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn start_when_connected_is_a_noop() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(None, None).await?;
        fixture.service.start(None, None).await?;
        assert_eq!(fixture.forwarder.with_state(|s| s.start_count), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_start_surfaces_error_status() {
        let fixture = fixture();
        fixture
            .forwarder
            .with_state(|s| s.fail_start = Some("tun device unavailable".to_string()));

        let err = fixture.service.start(None, None).await.expect_err("start must fail");
        assert!(matches!(err, Error::Forwarder(_)));
        assert_eq!(fixture.service.status(), Status::Error);
        assert!(fixture.service.last_cause().is_some_and(|c| c.contains("tun device")));
    }

    #[tokio::test]
    async fn restart_requires_connected() {
        let fixture = fixture();
        let err = fixture.service.restart().await.expect_err("not connected");
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn restart_restores_mode_and_selection() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(None, None).await?;
        fixture.service.select_outbound("user", "srv7").await?;

        fixture.service.restart().await?;

        assert_eq!(fixture.service.status(), Status::Connected);
        assert_eq!(fixture.forwarder.with_state(|s| s.start_count), 2);
        assert_eq!(fixture.service.get_selected(), ("user".to_string(), "srv7".to_string()));
        assert_eq!(
            fixture.forwarder.with_state(|s| s.selected.get(TAG_USER).cloned()),
            Some("srv7".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn select_into_other_group_switches_mode_and_closes_connections() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(Some(PreferredGroup::Lantern), None).await?;
        fixture.forwarder.add_connection("c1", &["ss-nyc-1", "lantern"]);
        fixture.forwarder.add_connection("c2", &["ss-nyc-1", "lantern"]);

        fixture.service.select_outbound("user", "srv7").await?;

        assert_eq!(fixture.forwarder.with_state(|s| s.mode.clone()), "user");
        assert!(fixture.forwarder.with_state(|s| s.connections.is_empty()));
        assert_eq!(fixture.forwarder.with_state(|s| s.closed.len()), 2);

        // a new flow now chains through the selected outbound
        fixture.forwarder.add_connection("c3", &["srv7", "user"]);
        let connections = fixture.service.connections().await?;
        assert_eq!(connections[0].chain[0], "srv7");

        let (group, tag) = fixture.service.get_selected();
        assert_eq!((group.as_str(), tag.as_str()), ("user", "srv7"));
        Ok(())
    }

    #[tokio::test]
    async fn select_rejects_tags_outside_the_group() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(None, None).await?;

        let err = fixture
            .service
            .select_outbound("user", "ss-nyc-1")
            .await
            .expect_err("tag belongs to lantern");
        assert!(matches!(err, Error::TagNotInGroup { .. }));

        let err = fixture
            .service
            .select_outbound("staff", "srv7")
            .await
            .expect_err("unknown group");
        assert!(matches!(err, Error::UnknownGroup(_)));
        Ok(())
    }

    #[tokio::test]
    async fn active_walks_to_a_concrete_leaf() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(Some(PreferredGroup::Lantern), None).await?;

        let (group, leaf) = fixture.service.get_active().await?;
        assert_eq!(group, TAG_LANTERN);
        // mock groups select their first child: lantern → auto-lantern → ss-nyc-1
        assert_eq!(leaf, "ss-nyc-1");
        Ok(())
    }

    #[tokio::test]
    async fn unexpected_forwarder_exit_reports_error() -> anyhow::Result<()> {
        let fixture = fixture();
        let mut statuses = watch_status(fixture.bus);
        fixture.service.start(None, None).await?;
        drain(&mut statuses, 2).await;

        fixture.forwarder.trigger_exit("packet pipeline crashed");

        let after = drain(&mut statuses, 1).await;
        assert_eq!(after, vec![Status::Error]);
        assert_eq!(fixture.service.status(), Status::Error);
        assert!(fixture.service.last_cause().is_some_and(|c| c.contains("crashed")));
        Ok(())
    }

    #[tokio::test]
    async fn selected_falls_back_to_cache_when_down() -> anyhow::Result<()> {
        let fixture = fixture();
        fixture.service.start(None, None).await?;
        fixture.service.select_outbound("user", "srv7").await?;
        fixture.service.stop().await?;

        assert_eq!(fixture.service.get_selected(), ("user".to_string(), "srv7".to_string()));
        Ok(())
    }
}
