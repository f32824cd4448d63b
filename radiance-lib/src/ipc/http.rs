//! Minimal HTTP/1.1 framing for the local control socket.
//!
//! The endpoint surface is small and fixed, so requests and responses are
//! framed by hand: request line, headers, optional `Content-Length` body.
//! Responses always carry a `Content-Length` except the SSE stream.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use std::io;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_SSE: &str = "text/event-stream; charset=utf-8";

const MAX_HEAD_LINE: usize = 8 * 1024;
const MAX_BODY: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed http message")]
    Malformed,
    #[error("message too large")]
    TooLarge,
    #[error("connection closed")]
    Closed,
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<String, Error> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(Error::Closed);
    }
    if line.len() > MAX_HEAD_LINE {
        return Err(Error::TooLarge);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn read_headers<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<Vec<(String, String)>, Error> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        let (name, value) = line.split_once(':').ok_or(Error::Malformed)?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

async fn read_body<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
    headers: &[(String, String)],
) -> Result<Vec<u8>, Error> {
    let length: usize = match header(headers, "content-length") {
        Some(raw) => raw.parse().map_err(|_| Error::Malformed)?,
        None => 0,
    };
    if length > MAX_BODY {
        return Err(Error::TooLarge);
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<Request, Error> {
    let request_line = read_line(reader).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(Error::Malformed)?.to_string();
    let path = parts.next().ok_or(Error::Malformed)?.to_string();
    if parts.next().is_none_or(|v| !v.starts_with("HTTP/")) {
        return Err(Error::Malformed);
    }

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers).await?;
    Ok(Request {
        method,
        path,
        headers,
        body,
    })
}

pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Result<Response, Error> {
    let status_line = read_line(reader).await?;
    let mut parts = status_line.split_whitespace();
    if parts.next().is_none_or(|v| !v.starts_with("HTTP/")) {
        return Err(Error::Malformed);
    }
    let status: u16 = parts.next().ok_or(Error::Malformed)?.parse().map_err(|_| Error::Malformed)?;

    let headers = read_headers(reader).await?;
    let body = read_body(reader, &headers).await?;
    Ok(Response {
        status,
        headers,
        body,
    })
}

pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &str,
    path: &str,
    body: Option<&[u8]>,
) -> Result<(), Error> {
    let body = body.unwrap_or_default();
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: radiance\r\nContent-Type: {CONTENT_TYPE_JSON}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), Error> {
    let head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_reason(status),
        body.len()
    );
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_sse_headers<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), Error> {
    let head =
        format!("HTTP/1.1 200 OK\r\nContent-Type: {CONTENT_TYPE_SSE}\r\nCache-Control: no-cache\r\nConnection: keep-alive\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// One SSE event carrying a CRLF-terminated JSON object.
pub async fn write_sse_event<W: AsyncWrite + Unpin>(writer: &mut W, data: &str) -> Result<(), Error> {
    writer.write_all(format!("data: {data}\r\n\r\n").as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Comment line clients ignore; sent as a keepalive.
pub async fn write_sse_comment<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), Error> {
    writer.write_all(b": keepalive\r\n\r\n").await?;
    writer.flush().await?;
    Ok(())
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
