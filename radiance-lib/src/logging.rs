use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

use crate::dirs;

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

pub const ENV_VAR_LOG_LEVEL: &str = "RADIANCE_LOG_LEVEL";
pub const ENV_VAR_LOG_PATH: &str = "RADIANCE_LOG_PATH";
pub const LOG_FILE: &str = "lantern-box.log";

const DEFAULT_LOG_FILTER: &str = "info";

pub fn make_file_fmt_layer(log_path: &PathBuf) -> FileFmtLayer {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .unwrap_or_else(|e| panic!("failed to open log file {}: {e}", log_path.display()));

    fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false)
}

fn log_path() -> PathBuf {
    if let Ok(dir) = env::var(ENV_VAR_LOG_PATH) {
        return PathBuf::from(dir).join(LOG_FILE);
    }

    match dirs::data_path(LOG_FILE) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("falling back to temp dir for logs: {e}");
            env::temp_dir().join(LOG_FILE)
        }
    }
}

fn filter() -> EnvFilter {
    let level = match env::var(ENV_VAR_LOG_LEVEL).ok().as_deref() {
        // fatal and panic are accepted for compatibility with other clients
        Some("fatal") | Some("panic") => Some("error".to_string()),
        Some(level) => Some(level.to_string()),
        None => None,
    };
    match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    }
}

pub fn init() -> (LogReloadHandle, PathBuf) {
    let log_path = log_path();
    let (reload_layer, reload_handle): (
        reload::Layer<FileFmtLayer, tracing_subscriber::Registry>,
        LogReloadHandle,
    ) = reload::Layer::new(make_file_fmt_layer(&log_path));
    tracing_subscriber::registry().with(reload_layer).with(filter()).init();
    (reload_handle, log_path)
}
