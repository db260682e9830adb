//! HTTP proxy: CONNECT tunnels and absolute-URL GET/POST

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::listener::connect_upstream;
use super::ProxyError;

/// Largest request head accepted
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Parsed request line and the headers we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub content_length: u64,
    /// Length of the head including the blank line
    pub head_len: usize,
}

impl RequestHead {
    /// Parse a complete head from the start of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, ProxyError> {
        let head_len = find_head_end(buf)
            .ok_or_else(|| ProxyError::Protocol("incomplete request head".to_string()))?;
        let head = std::str::from_utf8(&buf[..head_len])
            .map_err(|_| ProxyError::Protocol("request head is not UTF-8".to_string()))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::Protocol(format!(
                "bad request line {:?}",
                request_line
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(ProxyError::Protocol(format!("bad version {:?}", version)));
        }

        let mut content_length = 0;
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProxyError::Protocol(format!("bad header {:?}", line)))?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    ProxyError::Protocol(format!("bad content length {:?}", value.trim()))
                })?;
            }
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            content_length,
            head_len,
        })
    }
}

/// Split `host:port`, `[v6]:port`, or a bare host
fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let bad = || ProxyError::Protocol(format!("bad authority {:?}", authority));

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']').ok_or_else(bad)?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| bad())?,
            None if after.is_empty() => default_port,
            None => return Err(bad()),
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), port.parse().map_err(|_| bad())?)),
        Some(_) => Err(bad()),
        None if !authority.is_empty() => Ok((authority.to_string(), default_port)),
        None => Err(bad()),
    }
}

/// `http://host[:port]/path` -> (host, port)
fn split_url(url: &str) -> Result<(String, u16), ProxyError> {
    let (rest, default_port) = if let Some(rest) = url.strip_prefix("http://") {
        (rest, 80)
    } else if let Some(rest) = url.strip_prefix("https://") {
        (rest, 443)
    } else {
        return Err(ProxyError::Protocol(format!("not an absolute URL: {:?}", url)));
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    split_authority(authority, default_port)
}

/// Serve one HTTP proxy client
pub(super) async fn serve(mut client: TcpStream, connect_timeout: Duration) -> Result<(), ProxyError> {
    let buf = match read_head(&mut client).await {
        Ok(buf) => buf,
        Err(e) => {
            respond(&mut client, "400 Bad Request").await?;
            return Err(e);
        }
    };
    let head = match RequestHead::parse(&buf) {
        Ok(head) => head,
        Err(e) => {
            respond(&mut client, "400 Bad Request").await?;
            return Err(e);
        }
    };

    match head.method.as_str() {
        "CONNECT" => tunnel(client, &head, &buf, connect_timeout).await,
        "GET" | "POST" => forward(client, &head, &buf, connect_timeout).await,
        other => {
            tracing::debug!("Refusing {} request", other);
            respond(&mut client, "501 Not Implemented").await
        }
    }
}

async fn tunnel(
    mut client: TcpStream,
    head: &RequestHead,
    buf: &[u8],
    connect_timeout: Duration,
) -> Result<(), ProxyError> {
    let (host, port) = match split_authority(&head.target, 443) {
        Ok(authority) => authority,
        Err(e) => {
            respond(&mut client, "400 Bad Request").await?;
            return Err(e);
        }
    };

    let mut upstream = match connect_upstream(&host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("CONNECT {}:{} failed: {}", host, port, e);
            return respond(&mut client, "502 Bad Gateway").await;
        }
    };

    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    tracing::debug!("Tunnel to {}:{} established", host, port);

    // Bytes the client sent right after the head belong to the tunnel
    let early = &buf[head.head_len..];
    if !early.is_empty() {
        upstream.write_all(early).await?;
    }

    relay_halves(client, upstream).await
}

async fn forward(
    mut client: TcpStream,
    head: &RequestHead,
    buf: &[u8],
    connect_timeout: Duration,
) -> Result<(), ProxyError> {
    let (host, port) = match split_url(&head.target) {
        Ok(authority) => authority,
        Err(e) => {
            respond(&mut client, "400 Bad Request").await?;
            return Err(e);
        }
    };

    let mut upstream = match connect_upstream(&host, port, connect_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!("{} {} failed: {}", head.method, head.target, e);
            return respond(&mut client, "502 Bad Gateway").await;
        }
    };

    upstream.write_all(&buf[..head.head_len]).await?;

    let early = &buf[head.head_len..];
    let early_len = early.len().min(head.content_length as usize);
    upstream.write_all(&early[..early_len]).await?;
    let remaining = head.content_length - early_len as u64;
    if remaining > 0 {
        let copied = tokio::io::copy(&mut (&mut client).take(remaining), &mut upstream).await?;
        if copied < remaining {
            return Err(ProxyError::Protocol(format!(
                "request body ended after {} of {} bytes",
                head.content_length - remaining + copied,
                head.content_length
            )));
        }
    }

    tokio::io::copy(&mut upstream, &mut client).await?;
    client.shutdown().await?;
    Ok(())
}

/// Copy both directions; each side's write half is shut down on its own
async fn relay_halves(client: TcpStream, upstream: TcpStream) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let outbound = async {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        result
    };
    let inbound = async {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(outbound, inbound);
    tracing::trace!("Tunnel closed after {:?} bytes out, {:?} bytes in", sent, received);
    sent?;
    received?;
    Ok(())
}

/// Read until the blank line that ends the head
async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];
    loop {
        if find_head_end(&buf).is_some() {
            return Ok(buf);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(ProxyError::Protocol("request head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::Protocol("connection closed inside request head".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
        .filter(|end| *end <= MAX_HEAD_SIZE)
}

async fn respond<S>(stream: &mut S, status: &str) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
