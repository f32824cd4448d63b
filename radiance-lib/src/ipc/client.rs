//! Client side of the control plane, used by the control CLI.

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::http;
use super::{ErrorBody, MetricsBody, ModeBody, SelectionBody, StartBody, StatusBody};
use crate::dirs;
use crate::status::{Status, StatusUpdate};
use crate::tunnel::{Connection, OutboundInfo};

const CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("service not running")]
    ServiceNotRunning,
    #[error("error accessing socket at `{socket_path}`: {error}")]
    SocketPathIO { socket_path: PathBuf, error: io::Error },
    #[error("error connecting socket at `{socket_path:?}`: {error:?}")]
    ConnectSocketIO { socket_path: PathBuf, error: io::Error },
    #[error("http error: {0}")]
    Http(#[from] http::Error),
    #[error("failed serializing request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("request timed out")]
    Timeout,
    #[error("service rejected request ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("unable to determine socket path: {0}")]
    Dirs(#[from] dirs::Error),
}

#[derive(Clone, Debug)]
pub struct Client {
    socket_path: PathBuf,
}

impl Client {
    pub fn new(socket_path: PathBuf) -> Client {
        Client { socket_path }
    }

    pub fn default_path() -> Result<PathBuf, Error> {
        if let Ok(path) = std::env::var(super::ENV_VAR_SOCKET_PATH) {
            return Ok(PathBuf::from(path));
        }
        Ok(dirs::data_path(super::SOCKET_FILE)?)
    }

    pub async fn status(&self) -> Result<Status, Error> {
        let body: StatusBody = self.get("/status").await?;
        Ok(body.status)
    }

    pub async fn metrics(&self) -> Result<MetricsBody, Error> {
        self.get("/metrics").await
    }

    pub async fn start(&self, group: Option<String>, tag: Option<String>) -> Result<Status, Error> {
        let body = StartBody {
            options: String::new(),
            group,
            tag,
        };
        let resp: StatusBody = self.post("/service/start", Some(serde_json::to_vec(&body)?)).await?;
        Ok(resp.status)
    }

    pub async fn start_with_options(&self, options_json: String) -> Result<Status, Error> {
        let body = StartBody {
            options: options_json,
            group: None,
            tag: None,
        };
        let resp: StatusBody = self.post("/service/start", Some(serde_json::to_vec(&body)?)).await?;
        Ok(resp.status)
    }

    pub async fn stop(&self) -> Result<Status, Error> {
        let resp: StatusBody = self.post("/service/stop", None).await?;
        Ok(resp.status)
    }

    pub async fn restart(&self) -> Result<Status, Error> {
        let resp: StatusBody = self.post("/service/restart", None).await?;
        Ok(resp.status)
    }

    pub async fn clash_mode(&self) -> Result<String, Error> {
        let body: ModeBody = self.get("/clash/mode").await?;
        Ok(body.mode)
    }

    pub async fn set_clash_mode(&self, mode: &str) -> Result<(), Error> {
        let body = ModeBody {
            mode: mode.to_string(),
        };
        let _: ModeBody = self.post("/clash/mode", Some(serde_json::to_vec(&body)?)).await?;
        Ok(())
    }

    pub async fn selected(&self) -> Result<SelectionBody, Error> {
        self.get("/outbound/select").await
    }

    pub async fn select(&self, group_tag: &str, outbound_tag: &str) -> Result<(), Error> {
        let body = SelectionBody {
            group_tag: group_tag.to_string(),
            outbound_tag: outbound_tag.to_string(),
        };
        let _: SelectionBody = self.post("/outbound/select", Some(serde_json::to_vec(&body)?)).await?;
        Ok(())
    }

    pub async fn active(&self) -> Result<SelectionBody, Error> {
        self.get("/outbound/active").await
    }

    pub async fn groups(&self) -> Result<Vec<OutboundInfo>, Error> {
        self.get("/groups").await
    }

    pub async fn connections(&self) -> Result<Vec<Connection>, Error> {
        self.get("/connections").await
    }

    pub async fn close_connections(&self, ids: &[String]) -> Result<(), Error> {
        let _: serde_json::Value = self.post("/connections/close", Some(serde_json::to_vec(ids)?)).await?;
        Ok(())
    }

    /// Long-lived subscription to `/status/events`; `cb` runs for every
    /// update until the server goes away.
    pub async fn watch_status(&self, mut cb: impl FnMut(StatusUpdate)) -> Result<(), Error> {
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();
        http::write_request(&mut writer, "GET", "/status/events", None).await?;

        let mut reader = BufReader::new(read_half);
        // skip the response head
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(http::Error::IO)?;
            if n == 0 {
                return Ok(());
            }
            if line.trim_end().is_empty() {
                break;
            }
        }

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.map_err(http::Error::IO)?;
            if n == 0 {
                return Ok(());
            }
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data: ") {
                match serde_json::from_str::<StatusUpdate>(data) {
                    Ok(update) => cb(update),
                    Err(e) => tracing::warn!(error = ?e, %data, "ignoring malformed status event"),
                }
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.request("GET", path, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<Vec<u8>>) -> Result<T, Error> {
        self.request("POST", path, body).await
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, path: &str, body: Option<Vec<u8>>) -> Result<T, Error> {
        let stream = self.connect().await?;
        let (read_half, mut writer) = stream.into_split();

        let exchange = async {
            http::write_request(&mut writer, method, path, body.as_deref()).await?;
            let mut reader = BufReader::new(read_half);
            http::read_response(&mut reader).await
        };
        let resp = tokio::time::timeout(CALL_DEADLINE, exchange)
            .await
            .map_err(|_| Error::Timeout)??;

        if resp.status != 200 {
            let message = serde_json::from_slice::<ErrorBody>(&resp.body)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&resp.body).to_string());
            return Err(Error::Api {
                status: resp.status,
                message,
            });
        }
        Ok(serde_json::from_slice(&resp.body)?)
    }

    async fn connect(&self) -> Result<UnixStream, Error> {
        check_path(&self.socket_path)?;
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|error| Error::ConnectSocketIO {
                socket_path: self.socket_path.clone(),
                error,
            })
    }
}

fn check_path(socket_path: &Path) -> Result<(), Error> {
    match socket_path.try_exists() {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::ServiceNotRunning),
        Err(error) => Err(Error::SocketPathIO {
            socket_path: socket_path.to_path_buf(),
            error,
        }),
    }
}
