//! Error types for the reverse command server.

use tether_config::{ConfigError, join_errors};

/// Errors surfaced to the embedder.
///
/// Transient network failures are never propagated; the server logs them
/// and self-heals through its reconnect path. Only construction-time
/// validation fails loudly.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ConfigError>),
}

/// Failure of a single dial attempt. Logged by the state machine, which
/// then schedules a redial; never propagated.
#[derive(Debug, thiserror::Error)]
pub(crate) enum DialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("timed out")]
    Timeout,
}
