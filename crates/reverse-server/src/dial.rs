//! Outbound connection establishment.
//!
//! Plain `ws://` only; when transport security is needed it is terminated
//! by infrastructure in front of the control plane, not here. Supports
//! tunneling through an HTTP proxy via `CONNECT`, with optional basic
//! authentication.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::{WebSocketStream, client_async};

use tether_config::{ConfigStore, coerce};

use crate::error::DialError;

pub(crate) type WsStream = WebSocketStream<TcpStream>;

/// Longest CONNECT response head the dialer will read.
const MAX_PROXY_RESPONSE_HEAD: usize = 8 * 1024;

/// Snapshot of the connection-relevant configuration, taken when the
/// dial starts so a concurrent reconfigure cannot change targets under a
/// half-built connection.
#[derive(Debug, Clone)]
pub(crate) struct DialConfig {
    pub(crate) url: String,
    pub(crate) proxy_url: Option<String>,
    pub(crate) proxy_username: Option<String>,
    pub(crate) proxy_password: Option<String>,
    pub(crate) proxy_timeout: Duration,
    pub(crate) connect_timeout: Duration,
}

impl DialConfig {
    pub(crate) fn from_store(store: &ConfigStore) -> Self {
        Self {
            url: string_key(store, "url"),
            proxy_url: optional_string_key(store, "proxy_url"),
            proxy_username: optional_string_key(store, "proxy_username"),
            proxy_password: optional_string_key(store, "proxy_password"),
            proxy_timeout: seconds_key(store, "proxy_timeout"),
            connect_timeout: seconds_key(store, "connect_timeout"),
        }
    }
}

/// Effective value of a string key, empty when unset.
pub(crate) fn string_key(store: &ConfigStore, key: &str) -> String {
    coerce::to_string_value(&store.get(key)).unwrap_or_default()
}

/// Effective value of an optional string key, `None` when unset.
pub(crate) fn optional_string_key(store: &ConfigStore, key: &str) -> Option<String> {
    let value = store.get(key);
    if value.is_null() {
        None
    } else {
        coerce::to_string_value(&value)
    }
}

/// Effective value of a seconds-valued float key as a [`Duration`].
pub(crate) fn seconds_key(store: &ConfigStore, key: &str) -> Duration {
    coerce::to_f64(&store.get(key))
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::ZERO)
}

/// Establishes the WebSocket connection described by `config`: TCP
/// (directly or through the proxy tunnel), `TCP_NODELAY`, then the
/// WebSocket open handshake, each phase bounded by its timeout.
pub(crate) async fn dial(config: DialConfig) -> Result<WsStream, DialError> {
    let (host, port) = endpoint_of(&config.url)?;

    let stream = match &config.proxy_url {
        Some(proxy_url) => {
            tokio::time::timeout(
                config.proxy_timeout,
                open_proxy_tunnel(proxy_url, &host, port, &config),
            )
            .await
            .map_err(|_| DialError::Timeout)??
        }
        None => tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| DialError::Timeout)??,
    };
    stream.set_nodelay(true)?;

    let (ws, _response) =
        tokio::time::timeout(config.connect_timeout, client_async(config.url.as_str(), stream))
            .await
            .map_err(|_| DialError::Timeout)??;
    Ok(ws)
}

/// Extracts host and port from a `ws://` URL.
fn endpoint_of(url: &str) -> Result<(String, u16), DialError> {
    let uri: Uri = url.parse().map_err(|_| DialError::InvalidUrl {
        url: url.to_string(),
        reason: "not a valid URI",
    })?;
    if uri.scheme_str() != Some("ws") {
        return Err(DialError::InvalidUrl {
            url: url.to_string(),
            reason: "only plaintext ws:// URLs are supported",
        });
    }
    let host = uri
        .host()
        .ok_or_else(|| DialError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host",
        })?
        .to_string();
    Ok((host, uri.port_u16().unwrap_or(80)))
}

/// Extracts host and port from an HTTP proxy URL.
fn proxy_endpoint_of(proxy_url: &str) -> Result<(String, u16), DialError> {
    let uri: Uri = proxy_url.parse().map_err(|_| DialError::InvalidUrl {
        url: proxy_url.to_string(),
        reason: "not a valid URI",
    })?;
    if !matches!(uri.scheme_str(), None | Some("http")) {
        return Err(DialError::InvalidUrl {
            url: proxy_url.to_string(),
            reason: "only http:// proxies are supported",
        });
    }
    let host = uri
        .host()
        .ok_or_else(|| DialError::InvalidUrl {
            url: proxy_url.to_string(),
            reason: "missing host",
        })?
        .to_string();
    Ok((host, uri.port_u16().unwrap_or(80)))
}

/// Connects to the proxy and issues a `CONNECT` for the target endpoint,
/// returning the tunneled stream once the proxy accepts.
async fn open_proxy_tunnel(
    proxy_url: &str,
    host: &str,
    port: u16,
    config: &DialConfig,
) -> Result<TcpStream, DialError> {
    let (proxy_host, proxy_port) = proxy_endpoint_of(proxy_url)?;
    let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if config.proxy_username.is_some() || config.proxy_password.is_some() {
        let credentials = format!(
            "{}:{}",
            config.proxy_username.as_deref().unwrap_or(""),
            config.proxy_password.as_deref().unwrap_or("")
        );
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // A CONNECT response carries no body; read the head only.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_PROXY_RESPONSE_HEAD {
            return Err(DialError::Proxy("response head too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(DialError::Proxy("proxy closed the connection".into()));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| DialError::Proxy("malformed CONNECT response".into()))?;
    if !(200..300).contains(&status) {
        return Err(DialError::Proxy(format!(
            "CONNECT rejected with status {status}"
        )));
    }

    Ok(stream)
}
