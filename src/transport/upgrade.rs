//! HTTP upgrade handshake
//!
//! Server side hijacks an inbound HTTP/1.1 request and answers with a bare
//! `101 Switching Protocols`; client side sends the upgrade request and waits
//! for the `101`. After either side returns, the connection carries raw
//! multiplexer frames.
//!
//! Both sides keep their `BufReader` inside the returned transport so bytes
//! the peer sent right after the handshake are not lost.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use super::{RawIo, Transport};
use crate::error::{FabricError, Result};

/// Exact response written by the server side of the handshake.
pub const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\r\n";

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\r\n";

/// Maximum header lines accepted before the blank line
const MAX_HEADER_LINES: usize = 64;

/// Maximum length of a single request/status/header line
const MAX_LINE_LEN: u64 = 8 * 1024;

/// Parameters for the client side of the handshake
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub host: String,
    pub path: String,
    /// Caller-supplied headers, sent before `Upgrade`/`Connection`
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialized request head, including the terminating blank line.
    ///
    /// Fails if any field would break out of its line.
    pub fn to_head(&self) -> Result<String> {
        check_field("path", &self.path, " ")?;
        check_field("host", &self.host, "")?;
        for (name, value) in &self.headers {
            if name.is_empty() {
                return Err(FabricError::UpgradeProtocol("empty header name".into()));
            }
            check_field("header name", name, ": \t")?;
            check_field("header value", value, "")?;
        }

        let mut head = format!("GET {} HTTP/1.1\r\nHost: {}\r\n", self.path, self.host);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Upgrade: tcp\r\nConnection: Upgrade\r\n\r\n");
        Ok(head)
    }
}

/// Reject CR, LF and any of `extra` in an outgoing request field.
fn check_field(what: &str, field: &str, extra: &str) -> Result<()> {
    match field.chars().find(|&c| c == '\r' || c == '\n' || extra.contains(c)) {
        Some(c) => Err(FabricError::UpgradeProtocol(format!(
            "{} {:?} contains forbidden character {:?}",
            what, field, c
        ))),
        None => Ok(()),
    }
}

/// Request line and headers of a hijacked inbound request
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one CRLF/LF-terminated line, without the terminator.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Err(FabricError::UpgradeProtocol(
            "connection closed during handshake".into(),
        ));
    }
    if !line.ends_with('\n') {
        return Err(FabricError::UpgradeProtocol(format!(
            "handshake line exceeds {} bytes",
            MAX_LINE_LEN
        )));
    }
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    Ok(line)
}

/// Read header lines up to and including the blank line.
async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Ok(headers);
        }
        if headers.len() >= MAX_HEADER_LINES {
            return Err(FabricError::UpgradeProtocol(format!(
                "more than {} header lines",
                MAX_HEADER_LINES
            )));
        }
        match line.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
            None => {
                return Err(FabricError::UpgradeProtocol(format!(
                    "malformed header line: {:?}",
                    line
                )))
            }
        }
    }
}

fn parse_request_line(line: &str) -> Result<(String, String)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version)) if version.starts_with("HTTP/1.") => {
            Ok((method.to_string(), path.to_string()))
        }
        _ => Err(FabricError::UpgradeProtocol(format!(
            "malformed request line: {:?}",
            line
        ))),
    }
}

/// Server side: hijack an inbound connection.
///
/// Reads the request head, requires `Upgrade: tcp`, writes
/// [`SWITCHING_PROTOCOLS`] and hands back the raw connection. Requests that
/// do not ask for the upgrade get a `400` and an `UpgradeProtocol` error.
pub async fn accept_upgrade<S: RawIo + 'static>(
    io: S,
    peer_addr: impl Into<String>,
) -> Result<(RequestHead, Transport)> {
    hijack(io, peer_addr.into(), None).await
}

/// Like [`accept_upgrade`], but answers `404` unless the request targets
/// `path`.
pub async fn accept_upgrade_at<S: RawIo + 'static>(
    io: S,
    peer_addr: impl Into<String>,
    path: &str,
) -> Result<(RequestHead, Transport)> {
    hijack(io, peer_addr.into(), Some(path)).await
}

async fn hijack<S: RawIo + 'static>(
    io: S,
    peer_addr: String,
    expected_path: Option<&str>,
) -> Result<(RequestHead, Transport)> {
    let mut reader = BufReader::new(io);

    let request_line = read_line(&mut reader).await?;
    let (method, path) = parse_request_line(&request_line)?;
    let headers = read_headers(&mut reader).await?;
    let head = RequestHead {
        method,
        path,
        headers,
    };

    let wants_tcp = head
        .header("Upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("tcp"));
    let rejection = if !wants_tcp {
        Some((BAD_REQUEST, "did not ask for Upgrade: tcp".to_string()))
    } else {
        match expected_path {
            Some(expected) if head.path != expected => {
                Some((NOT_FOUND, format!("targeted unknown path {}", head.path)))
            }
            _ => None,
        }
    };
    if let Some((response, reason)) = rejection {
        let _ = reader.write_all(response).await;
        let _ = reader.shutdown().await;
        return Err(FabricError::UpgradeProtocol(format!(
            "request from {} {}",
            peer_addr, reason
        )));
    }

    reader.write_all(SWITCHING_PROTOCOLS).await?;
    reader.flush().await?;
    debug!("[upgrade] hijacked {} {} from {}", head.method, head.path, peer_addr);

    Ok((head, Transport::upgraded(reader, peer_addr)))
}

/// Client side: send the upgrade request over an established connection.
pub async fn dial_upgrade<S: RawIo + 'static>(
    io: S,
    peer_addr: impl Into<String>,
    request: &UpgradeRequest,
) -> Result<Transport> {
    let peer_addr = peer_addr.into();
    let head = request.to_head()?;
    let mut reader = BufReader::new(io);

    reader.write_all(head.as_bytes()).await?;
    reader.flush().await?;

    let status = read_line(&mut reader).await?;
    if !status.contains("101") {
        return Err(FabricError::UpgradeProtocol(format!(
            "unexpected status line from {}: {:?}",
            peer_addr, status
        )));
    }
    read_headers(&mut reader).await?;
    debug!("[upgrade] upgraded connection to {}{}", peer_addr, request.path);

    Ok(Transport::upgraded(reader, peer_addr))
}

/// Dial `addr` over TCP and perform the client handshake.
pub async fn connect_upgrade(addr: &str, request: &UpgradeRequest) -> Result<Transport> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    dial_upgrade(stream, addr, request).await
}
