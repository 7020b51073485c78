//! HTTP CONNECT Tunnelling
//!
//! Opens a TCP stream to the upstream through an HTTP proxy. The WebSocket
//! and TLS handshakes then run over the returned stream unchanged.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Errors raised while tunnelling through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    /// A URL could not be reduced to `host:port`.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The proxy URL carries user info.
    #[error("proxy credentials are not supported")]
    Credentials,

    /// Reading from or writing to the proxy failed.
    #[error("proxy io error: {0}")]
    Io(String),

    /// The proxy answered CONNECT with a non-2xx status.
    #[error("proxy refused CONNECT: {0}")]
    Refused(String),

    /// The proxy sent more than [`MAX_RESPONSE_HEAD`] bytes without ending its head.
    #[error("proxy response head exceeds {MAX_RESPONSE_HEAD} bytes")]
    ResponseTooLarge,
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Connect to `proxy_url` and ask it to tunnel to the host of `target_url`.
///
/// # Errors
///
/// Returns `ProxyError` if either URL is unusable, the proxy is unreachable,
/// or it refuses the tunnel.
pub async fn connect_via_proxy(proxy_url: &str, target_url: &str) -> Result<TcpStream, ProxyError> {
    let proxy = authority(proxy_url)?;
    let target = authority(target_url)?;

    let mut stream = TcpStream::connect(&proxy).await?;
    let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    check_status(&head)?;

    tracing::debug!(%proxy, %target, "Proxy tunnel established");
    Ok(stream)
}

/// `host:port` of a URL, with the scheme's default port filled in.
fn authority(url: &str) -> Result<String, ProxyError> {
    let uri: Uri = url
        .parse()
        .map_err(|_| ProxyError::InvalidUrl(url.to_string()))?;

    if uri.authority().is_some_and(|a| a.as_str().contains('@')) {
        return Err(ProxyError::Credentials);
    }

    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidUrl(url.to_string()))?;
    let port = uri
        .port_u16()
        .or_else(|| match uri.scheme_str() {
            Some("wss" | "https") => Some(443),
            Some("ws" | "http") => Some(80),
            _ => None,
        })
        .ok_or_else(|| ProxyError::InvalidUrl(url.to_string()))?;

    Ok(format!("{host}:{port}"))
}

/// Read up to and including the blank line ending the response head.
///
/// Reads byte by byte so nothing after the head is consumed.
async fn read_response_head<R>(reader: &mut R) -> Result<String, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::ResponseTooLarge);
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(ProxyError::Io(
                "proxy closed the connection before responding".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn check_status(head: &str) -> Result<(), ProxyError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code))
            if version.starts_with("HTTP/1.") && code.len() == 3 && code.starts_with('2') =>
        {
            Ok(())
        }
        _ => Err(ProxyError::Refused(status_line.to_string())),
    }
}
