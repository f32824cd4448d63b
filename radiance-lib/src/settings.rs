//! Process-wide key/value settings backed by `settings.json`.
//!
//! Two modes: read/write (the service) and read-only with an optional file
//! watch (helper processes that must follow the service's settings without
//! ever contending on the file).

use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use std::{fs, io, thread};

use crate::dirs;
use crate::event;

pub const FILE_NAME: &str = "settings.json";

pub const LOCALE: &str = "locale";
pub const USER_LEVEL: &str = "user_level";
pub const DEVICE_ID: &str = "device_id";
pub const USER_ID: &str = "user_id";
pub const SMART_ROUTING: &str = "smart_routing";
pub const AD_BLOCK: &str = "ad_block";
pub const CONFIG_POLL_INTERVAL: &str = "config_poll_interval";
pub const ISSUE_MAX_ATTACHMENT_SIZE: &str = "issue_max_attachment_size";
pub const FORWARDER_BINARY: &str = "forwarder_binary";

const DEFAULT_LOCALE: &str = "fa-IR";
const DEFAULT_USER_LEVEL: &str = "free";
const FILE_MODE: u32 = 0o644;

// debounce for file-watch reloads, duplicate fs events arrive in bursts
const RELOAD_GRACE_PERIOD: Duration = Duration::from_millis(333);

#[derive(Debug, Error)]
pub enum Error {
    #[error("settings store is read-only")]
    ReadOnly,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("settings file is not a JSON object")]
    NotAnObject,
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    ReadWrite,
    ReadOnly,
}

/// Broadcast after a watched read-only store reloaded from disk.
#[derive(Clone, Debug)]
pub struct SettingsReloaded;

#[derive(Clone)]
pub struct Settings {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    mode: Mode,
    values: RwLock<Map<String, Value>>,
    // single writer; reads go through `values` directly
    write_lock: Mutex<()>,
    _watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl Settings {
    /// Opens the store read/write, seeding first-run defaults when the file
    /// does not exist yet.
    pub fn init(dir: &Path) -> Result<Settings, Error> {
        let settings = Self::open(dir, Mode::ReadWrite)?;
        settings.seed_defaults()?;
        Ok(settings)
    }

    /// Opens the store read-only. With `watch`, a debounced file change
    /// triggers a full reload; reload failures are logged, not surfaced.
    pub fn init_read_only(dir: &Path, watch: bool) -> Result<Settings, Error> {
        let settings = Self::open(dir, Mode::ReadOnly)?;
        if watch {
            settings.start_watching()?;
        }
        Ok(settings)
    }

    fn open(dir: &Path, mode: Mode) -> Result<Settings, Error> {
        let path = dir.join(FILE_NAME);
        let values = read_values(&path)?;
        Ok(Settings {
            inner: Arc::new(Inner {
                path,
                mode,
                values: RwLock::new(values),
                write_lock: Mutex::new(()),
                _watcher: Mutex::new(None),
            }),
        })
    }

    fn seed_defaults(&self) -> Result<(), Error> {
        let missing = {
            let values = self.read_guard();
            !values.contains_key(LOCALE) || !values.contains_key(USER_LEVEL) || !values.contains_key(DEVICE_ID)
        };
        if !missing {
            return Ok(());
        }
        let _writer = lock_ignore_poison(&self.inner.write_lock);
        let mut values = self.write_guard();
        values
            .entry(LOCALE.to_string())
            .or_insert_with(|| Value::String(DEFAULT_LOCALE.to_string()));
        values
            .entry(USER_LEVEL.to_string())
            .or_insert_with(|| Value::String(DEFAULT_USER_LEVEL.to_string()));
        values
            .entry(DEVICE_ID.to_string())
            .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        persist(&self.inner.path, &values)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.read_guard().get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.read_guard().get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.read_guard().get(key).and_then(Value::as_bool)
    }

    /// Durations are stored either as a humantime string ("10m") or as a
    /// plain number of seconds.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        match self.read_guard().get(key)? {
            Value::String(s) => humantime::parse_duration(s).ok(),
            Value::Number(n) => n.as_u64().map(Duration::from_secs),
            _ => None,
        }
    }

    pub fn get_string_slice(&self, key: &str) -> Option<Vec<String>> {
        let values = self.read_guard();
        let list = values.get(key)?.as_array()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        )
    }

    pub fn get_struct<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.read_guard().get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, key: &str, value: impl Serialize) -> Result<(), Error> {
        if self.inner.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        let value = serde_json::to_value(value)?;
        let _writer = lock_ignore_poison(&self.inner.write_lock);
        let mut values = self.write_guard();
        values.insert(key.to_string(), value);
        persist(&self.inner.path, &values)
    }

    /// Re-reads the backing file, replacing the in-memory view.
    pub fn reload(&self) -> Result<(), Error> {
        let fresh = read_values(&self.inner.path)?;
        *self.write_guard() = fresh;
        event::bus().emit(SettingsReloaded);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn start_watching(&self) -> Result<(), Error> {
        let parent = match self.inner.path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => return Ok(()),
        };
        let (tx, rx) = crossbeam_channel::unbounded::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        // watch the parent, the file itself is replaced by rename
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;
        *lock_ignore_poison(&self.inner._watcher) = Some(watcher);

        let weak = Arc::downgrade(&self.inner);
        let path = self.inner.path.clone();
        thread::spawn(move || watch_loop(weak, path, rx));
        Ok(())
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, Map<String, Value>> {
        match self.inner.values.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, Map<String, Value>> {
        match self.inner.values.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn watch_loop(
    weak: Weak<Inner>,
    path: PathBuf,
    rx: crossbeam_channel::Receiver<notify::Result<notify::Event>>,
) {
    let mut reload_at = crossbeam_channel::never();
    loop {
        crossbeam_channel::select! {
            recv(rx) -> event => {
                match event {
                    Ok(Ok(event)) if event.paths.iter().any(|p| p == &path) => {
                        reload_at = crossbeam_channel::after(RELOAD_GRACE_PERIOD);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(error = ?e, "settings watch error"),
                    // watcher dropped, stop following
                    Err(_) => return,
                }
            }
            recv(reload_at) -> _ => {
                reload_at = crossbeam_channel::never();
                let Some(inner) = weak.upgrade() else { return };
                let settings = Settings { inner };
                match settings.reload() {
                    Ok(_) => tracing::debug!("settings reloaded after file change"),
                    Err(e) => tracing::warn!(error = ?e, "failed reloading settings"),
                }
            }
        }
    }
}

fn read_values(path: &Path) -> Result<Map<String, Value>, Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(Error::IO(e)),
    };
    match serde_json::from_str::<Value>(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::NotAnObject),
    }
}

fn persist(path: &Path, values: &Map<String, Value>) -> Result<(), Error> {
    let bytes = serde_json::to_vec_pretty(&Value::Object(values.clone()))?;
    dirs::write_atomic(path, &bytes, FILE_MODE)?;
    Ok(())
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
