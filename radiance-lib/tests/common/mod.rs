//! Shared fixtures for the integration suite.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What the stub backend does with one incoming connection.
#[derive(Clone, Debug)]
pub enum Round {
    /// Accept and immediately drop the connection.
    Reset,
    /// Serve a complete HTTP response.
    Respond { status: u16, body: String },
}

/// Minimal scripted HTTP backend: each accepted connection consumes the
/// next round from the script; the last round repeats.
pub struct StubBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl StubBackend {
    pub async fn start(script: Vec<Round>) -> anyhow::Result<StubBackend> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let round = counter.fetch_add(1, Ordering::SeqCst);
                let action = script.get(round).or_else(|| script.last()).cloned();
                let Some(action) = action else { return };
                tokio::spawn(async move {
                    match action {
                        Round::Reset => drop(stream),
                        Round::Respond { status, body } => {
                            let _ = read_head(&mut stream).await;
                            let head = format!(
                                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            );
                            let _ = stream.write_all(head.as_bytes()).await;
                            let _ = stream.write_all(body.as_bytes()).await;
                            let _ = stream.flush().await;
                        }
                    }
                });
            }
        });

        Ok(StubBackend { addr, hits })
    }

    pub fn url(&self, path: &str) -> url::Url {
        url::Url::parse(&format!("http://{}{path}", self.addr)).expect("stub url")
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn read_head(stream: &mut tokio::net::TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    let mut content_length = 0usize;
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(buf);
        }
        buf.push(byte[0]);
        if buf.len() > 64 * 1024 {
            break;
        }
    }
    let head = String::from_utf8_lossy(&buf);
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        let _ = stream.read_exact(&mut body).await;
    }
    buf.extend_from_slice(&body);
    Ok(buf)
}
