//! Full control-plane round trip over a real Unix socket: lifecycle
//! commands, status reads and the SSE stream.

use std::sync::Arc;
use std::time::Duration;

use radiance_lib::ipc::{self, Client};
use radiance_lib::server::{Group, Manager, Server};
use radiance_lib::settings::Settings;
use radiance_lib::status::Status;
use radiance_lib::tunnel::TunnelService;
use radiance_lib::tunnel::mock::MockForwarder;
use serde_json::json;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// every tunnel here emits on the process-wide bus; run one test at a time
// so SSE sequence assertions see only their own service
static SERIAL: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

async fn serial() -> tokio::sync::MutexGuard<'static, ()> {
    SERIAL.get_or_init(|| tokio::sync::Mutex::new(())).lock().await
}

struct Harness {
    _dir: tempfile::TempDir,
    client: Client,
    forwarder: MockForwarder,
    cancel: CancellationToken,
}

async fn harness() -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("proxy.conf"),
        json!({
            "outbounds": [{"type": "shadowsocks", "tag": "ss-nyc-1", "server": "203.0.113.1"}]
        })
        .to_string(),
    )?;

    let settings = Settings::init(dir.path())?;
    let servers = Manager::open(dir.path())?;
    servers.add_servers(
        Group::User,
        vec![Server {
            group: Group::User,
            tag: "srv7".to_string(),
            kind: "hysteria2".to_string(),
            options: serde_json::Map::new(),
            location: None,
        }],
    )?;

    let forwarder = MockForwarder::new();
    let tunnel = TunnelService::new(
        Arc::new(forwarder.clone()),
        dir.path().to_path_buf(),
        settings,
        servers,
    );

    let socket_path = ipc::socket_path(dir.path());
    let listener = ipc::server::bind(&socket_path)?;
    let cancel = CancellationToken::new();
    tokio::spawn(ipc::server::serve(listener, tunnel, cancel.clone()));

    Ok(Harness {
        _dir: dir,
        client: Client::new(socket_path),
        forwarder,
        cancel,
    })
}

async fn next_status(rx: &mut mpsc::UnboundedReceiver<Status>) -> Status {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("status event timed out")
        .expect("stream closed")
}

#[tokio::test]
async fn start_stop_round_trip_with_sse_sequence() -> anyhow::Result<()> {
    let _serial = serial().await;
    let harness = harness().await?;

    // long-lived SSE subscriber, attached before the lifecycle begins
    let (tx, mut events) = mpsc::unbounded_channel();
    let watcher = harness.client.clone();
    tokio::spawn(async move {
        let _ = watcher
            .watch_status(|update| {
                let _ = tx.send(update.status);
            })
            .await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.client.status().await?, Status::Disconnected);

    let status = harness.client.start(None, None).await?;
    assert_eq!(status, Status::Connected);
    assert_eq!(harness.client.status().await?, Status::Connected);

    harness.client.stop().await?;
    assert_eq!(harness.client.status().await?, Status::Disconnected);

    assert_eq!(next_status(&mut events).await, Status::Connecting);
    assert_eq!(next_status(&mut events).await, Status::Connected);
    assert_eq!(next_status(&mut events).await, Status::Disconnecting);
    assert_eq!(next_status(&mut events).await, Status::Disconnected);

    // the service accepts a fresh start after the full cycle
    assert_eq!(harness.client.start(None, None).await?, Status::Connected);
    assert_eq!(next_status(&mut events).await, Status::Connecting);
    assert_eq!(next_status(&mut events).await, Status::Connected);

    harness.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn selection_and_mode_flow_over_ipc() -> anyhow::Result<()> {
    let _serial = serial().await;
    let harness = harness().await?;
    harness.client.start(Some("lantern".to_string()), None).await?;

    assert_eq!(harness.client.clash_mode().await?, "lantern");

    harness.forwarder.add_connection("c1", &["ss-nyc-1", "lantern"]);
    harness.client.select("user", "srv7").await?;

    assert_eq!(harness.client.clash_mode().await?, "user");
    let selected = harness.client.selected().await?;
    assert_eq!(selected.group_tag, "user");
    assert_eq!(selected.outbound_tag, "srv7");

    // prior connection was closed by the group switch
    assert!(harness.client.connections().await?.is_empty());

    let active = harness.client.active().await?;
    assert_eq!(active.group_tag, "user");
    assert_eq!(active.outbound_tag, "srv7");

    let groups = harness.client.groups().await?;
    assert!(groups.iter().any(|g| g.tag == "user"));
    assert!(groups.iter().any(|g| g.tag == "auto-all"));

    harness.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn client_faults_map_to_api_errors() -> anyhow::Result<()> {
    let _serial = serial().await;
    let harness = harness().await?;

    // restart requires a connected tunnel
    let err = harness.client.restart().await.expect_err("not connected");
    match err {
        radiance_lib::ipc::client::Error::Api { status, .. } => assert_eq!(status, 503),
        other => panic!("unexpected error: {other}"),
    }

    harness.client.start(None, None).await?;
    let err = harness
        .client
        .select("staff", "srv7")
        .await
        .expect_err("unknown group");
    match err {
        radiance_lib::ipc::client::Error::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("unexpected error: {other}"),
    }

    harness.cancel.cancel();
    Ok(())
}

#[tokio::test]
async fn metrics_report_counts() -> anyhow::Result<()> {
    let _serial = serial().await;
    let harness = harness().await?;
    harness.client.start(None, None).await?;
    harness.forwarder.add_connection("c1", &["ss-nyc-1"]);

    let metrics = harness.client.metrics().await?;
    assert_eq!(metrics.connections, 1);

    harness.client.close_connections(&["c1".to_string()]).await?;
    let metrics = harness.client.metrics().await?;
    assert_eq!(metrics.connections, 0);

    harness.cancel.cancel();
    Ok(())
}
