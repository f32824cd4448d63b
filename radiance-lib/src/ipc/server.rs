//! The control-plane server: one request per connection, JSON bodies, an
//! SSE stream for status events, peer credentials checked on every call.

use serde::Serialize;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::http::{self, CONTENT_TYPE_JSON};
use super::{ErrorBody, MetricsBody, ModeBody, SelectionBody, StartBody, StatusBody, auth};
use crate::options::Options;
use crate::options::builder::PreferredGroup;
use crate::status::StatusUpdate;
use crate::task;
use crate::tunnel;
use crate::tunnel::TunnelService;

// per-call read/write deadline
const CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("error binding socket at `{path}`: {error}")]
    Bind { path: PathBuf, error: io::Error },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Removes a stale socket file and binds a fresh listener with the right
/// permissions.
pub fn bind(path: &Path) -> Result<UnixListener, Error> {
    match std::fs::remove_file(path) {
        Ok(_) => tracing::debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Bind {
                path: path.to_path_buf(),
                error: e,
            });
        }
    }
    let listener = UnixListener::bind(path).map_err(|error| Error::Bind {
        path: path.to_path_buf(),
        error,
    })?;
    if let Err(e) = auth::set_socket_permissions(path) {
        tracing::warn!(error = ?e, "failed adjusting socket permissions");
    }
    Ok(listener)
}

/// Serves until cancelled. An accept failure is treated as the control
/// plane going away: the tunnel is closed and marked failed.
pub async fn serve(listener: UnixListener, tunnel: TunnelService, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let tunnel = tunnel.clone();
                let cancel = cancel.clone();
                task::spawn_guarded("ipc-conn", async move {
                    if let Err(e) = handle_conn(stream, tunnel, cancel).await {
                        tracing::debug!(error = ?e, "ipc connection failed");
                    }
                });
            }
            Err(e) => {
                tracing::error!(error = ?e, "control socket accept failed, shutting tunnel down");
                tunnel.report_error("control plane stopped unexpectedly");
                tunnel.shutdown().await;
                return;
            }
        }
    }
}

async fn handle_conn(stream: UnixStream, tunnel: TunnelService, cancel: CancellationToken) -> Result<(), http::Error> {
    let authorized = match stream.peer_cred() {
        Ok(cred) => auth::authorize(cred.uid(), cred.gid()),
        Err(e) => {
            tracing::warn!(error = ?e, "peer credentials unavailable, denying");
            false
        }
    };

    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let req = match tokio::time::timeout(CALL_DEADLINE, http::read_request(&mut reader)).await {
        Ok(Ok(req)) => req,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Ok(()),
    };
    tracing::debug!(method = %req.method, path = %req.path, "ipc request");

    if !authorized {
        return respond_error(&mut writer, 403, "peer is not authorized").await;
    }

    // the SSE stream is long-lived, everything else honors the deadline
    if req.method == "GET" && req.path == "/status/events" {
        return stream_status(&mut writer, &tunnel, cancel).await;
    }

    let outcome = route(&req, &tunnel).await;
    let write = async {
        match outcome {
            Ok(body) => http::write_response(&mut writer, 200, CONTENT_TYPE_JSON, &body).await,
            Err((status, message)) => respond_error(&mut writer, status, &message).await,
        }
    };
    match tokio::time::timeout(CALL_DEADLINE, write).await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

async fn respond_error<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    message: &str,
) -> Result<(), http::Error> {
    let body = serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
    })
    .unwrap_or_default();
    http::write_response(writer, status, CONTENT_TYPE_JSON, &body).await
}

type RouteResult = Result<Vec<u8>, (u16, String)>;

fn json_body(value: &impl Serialize) -> RouteResult {
    serde_json::to_vec(value).map_err(|e| (500, format!("serialization failed: {e}")))
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, (u16, String)> {
    serde_json::from_slice(body).map_err(|e| (400, format!("malformed request body: {e}")))
}

fn tunnel_error(e: tunnel::Error) -> (u16, String) {
    let status = match &e {
        tunnel::Error::NotConnected => 503,
        tunnel::Error::UnknownGroup(_) | tunnel::Error::TagNotInGroup { .. } => 400,
        tunnel::Error::Options(_) => 503,
        tunnel::Error::Forwarder(_) | tunnel::Error::Cache(_) => 500,
    };
    (status, e.to_string())
}

async fn route(req: &http::Request, tunnel: &TunnelService) -> RouteResult {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/status") => json_body(&StatusBody {
            status: tunnel.status(),
        }),
        ("GET", "/metrics") => json_body(&metrics(tunnel).await),
        ("POST", "/service/start") => {
            let body: StartBody = if req.body.is_empty() {
                StartBody::default()
            } else {
                parse_body(&req.body)?
            };
            let started = if body.options.is_empty() {
                let group = match &body.group {
                    Some(raw) => {
                        Some(PreferredGroup::from_str(raw).map_err(|e| (400, e.to_string()))?)
                    }
                    None => None,
                };
                tunnel.start(group, body.tag.as_deref()).await
            } else {
                let options: Options =
                    serde_json::from_str(&body.options).map_err(|e| (400, format!("malformed options: {e}")))?;
                tunnel.start_with_options(options).await
            };
            started.map_err(|e| {
                let (_, message) = tunnel_error(e);
                (503, message)
            })?;
            json_body(&StatusBody {
                status: tunnel.status(),
            })
        }
        ("POST", "/service/stop") => {
            tunnel.stop().await.map_err(tunnel_error)?;
            json_body(&StatusBody {
                status: tunnel.status(),
            })
        }
        ("POST", "/service/restart") => {
            tunnel.restart().await.map_err(|e| {
                let (status, message) = tunnel_error(e);
                (if status == 503 { 503 } else { 500 }, message)
            })?;
            json_body(&StatusBody {
                status: tunnel.status(),
            })
        }
        ("GET", "/clash/mode") => json_body(&ModeBody {
            mode: tunnel.clash_mode(),
        }),
        ("POST", "/clash/mode") => {
            let body: ModeBody = parse_body(&req.body)?;
            tunnel.set_clash_mode(&body.mode).await.map_err(tunnel_error)?;
            json_body(&ModeBody { mode: body.mode })
        }
        ("GET", "/outbound/select") => {
            let (group_tag, outbound_tag) = tunnel.get_selected();
            json_body(&SelectionBody {
                group_tag,
                outbound_tag,
            })
        }
        ("POST", "/outbound/select") => {
            let body: SelectionBody = parse_body(&req.body)?;
            tunnel
                .select_outbound(&body.group_tag, &body.outbound_tag)
                .await
                .map_err(tunnel_error)?;
            json_body(&body)
        }
        ("GET", "/outbound/active") => {
            let (group_tag, outbound_tag) = tunnel.get_active().await.map_err(tunnel_error)?;
            json_body(&SelectionBody {
                group_tag,
                outbound_tag,
            })
        }
        ("GET", "/groups") => {
            let groups = tunnel.groups().await.map_err(tunnel_error)?;
            json_body(&groups)
        }
        ("GET", "/connections") => {
            let connections = tunnel.connections().await.map_err(tunnel_error)?;
            json_body(&connections)
        }
        ("POST", "/connections/close") => {
            let ids: Vec<String> = parse_body(&req.body)?;
            tunnel.close_connections(&ids).await.map_err(tunnel_error)?;
            json_body(&serde_json::json!({}))
        }
        _ => Err((404, format!("no such endpoint: {} {}", req.method, req.path))),
    }
}

async fn metrics(tunnel: &TunnelService) -> MetricsBody {
    let connections = tunnel.connections().await.map(|c| c.len() as u64).unwrap_or_default();
    let traffic = tunnel.traffic_total().await.unwrap_or_default();
    MetricsBody {
        memory: resident_memory(),
        goroutines: tokio::runtime::Handle::current().metrics().num_alive_tasks() as u64,
        connections,
        uplink_total: traffic.uplink_total,
        downlink_total: traffic.downlink_total,
    }
}

#[cfg(target_os = "linux")]
fn resident_memory() -> u64 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    pages * 4096
}

#[cfg(not(target_os = "linux"))]
fn resident_memory() -> u64 {
    0
}

/// Pushes every status transition to the peer until it disconnects; the
/// bus subscription is released on the way out.
async fn stream_status<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    tunnel: &TunnelService,
    cancel: CancellationToken,
) -> Result<(), http::Error> {
    http::write_sse_headers(writer).await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StatusUpdate>();
    let bus = tunnel.bus();
    let handle = bus.subscribe::<StatusUpdate, _>(move |update| {
        let _ = tx.send(update);
    });

    let result = async {
        // keepalives surface a gone peer even when the status is quiet
        let mut keepalive = tokio::time::interval(Duration::from_secs(30));
        keepalive.reset();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                update = rx.recv() => {
                    let Some(update) = update else { return Ok(()) };
                    let data = serde_json::to_string(&update).unwrap_or_default();
                    http::write_sse_event(writer, &data).await?;
                }
                _ = keepalive.tick() => {
                    http::write_sse_comment(writer).await?;
                }
            }
        }
    }
    .await;

    bus.unsubscribe(handle);
    result
}

