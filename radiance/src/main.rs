use tokio_util::sync::CancellationToken;
use url::Url;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use radiance_lib::config::handler::{DEFAULT_CONFIG_URL, Handler, Poll};
use radiance_lib::kindling::{Kindling, dnstt};
use radiance_lib::settings::{self, Settings};
use radiance_lib::status::Status;
use radiance_lib::tunnel::TunnelService;
use radiance_lib::tunnel::process::{DEFAULT_BINARY, ProcessForwarder};
use radiance_lib::{bypass, dirs, ipc, kindling, logging, server, task};

mod cli;

const EXIT_OK: i32 = 0;
const EXIT_INIT_FAILURE: i32 = 1;
const EXIT_SOCKET_BIND_FAILURE: i32 = 2;

// Avoid musl's default allocator due to degraded performance
// https://nickb.dev/blog/default-musl-allocator-considered-harmful-to-performance
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let (_log_handle, log_path) = logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_path = %log_path.display(),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(args).await;
    if exit != EXIT_OK {
        tracing::warn!(exit, "abnormal exit");
    }
    process::exit(exit)
}

async fn run(args: cli::Cli) -> i32 {
    let data_dir = match dirs::data_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!(error = ?e, "cannot resolve data directory");
            return EXIT_INIT_FAILURE;
        }
    };

    let settings = match Settings::init(&data_dir) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = ?e, "cannot initialize settings");
            return EXIT_INIT_FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    // local CONNECT listener backing the kindling-proxy outbound
    match bypass::bind(kindling::PROXY_ADDRESS).await {
        Ok(listener) => {
            let cancel = shutdown.child_token();
            task::spawn_guarded("kindling-proxy", async move {
                bypass::serve(listener, cancel).await;
            });
        }
        Err(e) => {
            tracing::warn!(error = ?e, "kindling proxy listener unavailable");
        }
    }

    let kindling = Kindling::build(&settings, &data_dir, Arc::new(dnstt::HttpsCarrier::new()));
    dnstt::spawn_refresh(kindling.clone(), data_dir.clone(), shutdown.child_token());

    let config_url = match Url::parse(DEFAULT_CONFIG_URL) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = ?e, "invalid config url");
            return EXIT_INIT_FAILURE;
        }
    };
    let poll = config_poll(&settings);
    let config = Handler::start(kindling.clone(), settings.clone(), data_dir.clone(), config_url, poll);

    let servers = match server::Manager::open(&data_dir) {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(error = ?e, "cannot open server store");
            return EXIT_INIT_FAILURE;
        }
    };

    let binary = args
        .forwarder_binary
        .or_else(|| settings.get_string(settings::FORWARDER_BINARY).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY));
    let forwarder = match ProcessForwarder::new(binary, data_dir.clone()) {
        Ok(forwarder) => forwarder,
        Err(e) => {
            tracing::error!(error = ?e, "cannot set up packet forwarder");
            return EXIT_INIT_FAILURE;
        }
    };
    let tunnel = TunnelService::new(Arc::new(forwarder), data_dir.clone(), settings.clone(), servers);

    // a fresh config while connected rebuilds the routing table
    let tunnel_for_config = tunnel.clone();
    let _config_listener = config.add_config_listener(move |old, _new| {
        if old.is_none() {
            return;
        }
        let tunnel = tunnel_for_config.clone();
        task::spawn_guarded("config-restart", async move {
            if tunnel.status() != Status::Connected {
                return;
            }
            match tunnel.restart().await {
                Ok(_) => tracing::info!("tunnel restarted on config update"),
                Err(e) => tracing::warn!(error = ?e, "restart on config update failed"),
            }
        });
    });

    let socket_path = match args.socket_path {
        Some(path) => path,
        None => ipc::socket_path(&data_dir),
    };
    let listener = match ipc::server::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = ?e, "cannot bind control socket");
            return EXIT_SOCKET_BIND_FAILURE;
        }
    };
    tracing::info!(socket = %socket_path.display(), "control socket ready");

    let serve_cancel = shutdown.child_token();
    let serving = tokio::spawn(ipc::server::serve(listener, tunnel.clone(), serve_cancel));

    wait_for_signal().await;
    tracing::info!("initiating shutdown");

    shutdown.cancel();
    tunnel.shutdown().await;
    config.stop();
    kindling.shutdown();
    let _ = serving.await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, "failed removing socket");
        }
    }
    EXIT_OK
}

fn config_poll(settings: &Settings) -> Poll {
    if let Some(raw) = settings.get_int(settings::CONFIG_POLL_INTERVAL) {
        if raw < 0 {
            return Poll::Disabled;
        }
    }
    match settings.get_duration(settings::CONFIG_POLL_INTERVAL) {
        Some(interval) => Poll::Every(interval),
        None => Poll::Default,
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::error!(error = ?e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
