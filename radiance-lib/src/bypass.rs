//! Loopback HTTP-CONNECT plumbing.
//!
//! While the tunnel is up, rescue transports dial through the `bypass-in`
//! inbound so their traffic is routed direct instead of into the VPN. The
//! dialer side lives here, together with a small CONNECT listener the daemon
//! uses for the `kindling-proxy` leg.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use std::io;

use crate::task;

/// Address of the forwarder's bypass inbound.
pub const ADDRESS: &str = "127.0.0.1:14985";

const MAX_HANDSHAKE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("proxy refused CONNECT: {0}")]
    Handshake(String),
    #[error("malformed CONNECT exchange")]
    Protocol,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

pub fn proxy() -> Result<reqwest::Proxy, reqwest::Error> {
    reqwest::Proxy::all(format!("http://{ADDRESS}"))
}

/// Opens a TCP stream to `host:port` through the bypass proxy; when the
/// bypass port is unreachable (tunnel down) it falls back to a direct dial.
pub async fn dial(host: &str, port: u16) -> Result<TcpStream, Error> {
    dial_through(ADDRESS, host, port).await
}

pub async fn dial_through(proxy_addr: &str, host: &str, port: u16) -> Result<TcpStream, Error> {
    let proxied = match TcpStream::connect(proxy_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(error = ?e, "bypass proxy unreachable, dialing direct");
            return Ok(TcpStream::connect((host, port)).await?);
        }
    };
    connect_handshake(proxied, host, port).await
}

/// Single-shot CONNECT handshake; any status other than 200 is an error.
async fn connect_handshake(mut stream: TcpStream, host: &str, port: u16) -> Result<TcpStream, Error> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_HANDSHAKE {
            return Err(Error::Protocol);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Protocol);
        }
        buf.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(Error::Handshake(status_line.to_string()));
    }
    Ok(stream)
}

pub async fn bind(addr: &str) -> Result<TcpListener, Error> {
    Ok(TcpListener::bind(addr).await?)
}

/// Runs a plain CONNECT proxy on `listener` until cancelled.
pub async fn serve(listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                tracing::trace!(%peer, "connect proxy accepted");
                task::spawn_guarded("connect-proxy-conn", async move {
                    if let Err(e) = handle_conn(stream).await {
                        tracing::debug!(error = ?e, "connect proxy connection failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = ?e, "connect proxy accept failed");
            }
        }
    }
}

async fn handle_conn(mut stream: TcpStream) -> Result<(), Error> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_HANDSHAKE {
            return Err(Error::Protocol);
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Protocol);
        }
        buf.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&buf);
    let request_line = head.lines().next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let (method, target) = (parts.next().unwrap_or_default(), parts.next().unwrap_or_default());

    if method != "CONNECT" {
        stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n").await?;
        return Err(Error::Protocol);
    }

    let mut upstream = match TcpStream::connect(target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Err(Error::IO(e));
        }
    };

    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_server() -> anyhow::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Ok(addr)
    }

    #[tokio::test]
    async fn connect_through_proxy_reaches_target() -> anyhow::Result<()> {
        let echo = echo_server().await?;
        let listener = bind("127.0.0.1:0").await?;
        let proxy_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, cancel.clone()));

        let mut stream = dial_through(&proxy_addr.to_string(), &echo.ip().to_string(), echo.port()).await?;
        stream.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_proxy_falls_back_to_direct() -> anyhow::Result<()> {
        let echo = echo_server().await?;
        // nothing listens on this port
        let mut stream = dial_through("127.0.0.1:1", &echo.ip().to_string(), echo.port()).await?;
        stream.write_all(b"direct").await?;
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"direct");
        Ok(())
    }

    #[tokio::test]
    async fn non_connect_method_is_rejected() -> anyhow::Result<()> {
        let listener = bind("127.0.0.1:0").await?;
        let proxy_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, cancel.clone()));

        let mut stream = TcpStream::connect(proxy_addr).await?;
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await?;
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"HTTP/1.1 405");

        cancel.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn failed_upstream_yields_bad_gateway() -> anyhow::Result<()> {
        let listener = bind("127.0.0.1:0").await?;
        let proxy_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, cancel.clone()));

        let err = dial_through(&proxy_addr.to_string(), "127.0.0.1", 1)
            .await
            .expect_err("upstream must be unreachable");
        assert!(matches!(err, Error::Handshake(_)));

        cancel.cancel();
        Ok(())
    }
}
