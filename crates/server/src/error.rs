//! Error taxonomy for the connection server.
//!
//! `ConfigError` is the only process-fatal kind. Everything a session can
//! hit is folded into `SessionError` and stays local to that connection.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Startup configuration problems (bad certificate/key paths, malformed config file)
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{kind} file not found: {path}")]
    MissingFile { kind: &'static str, path: PathBuf },

    #[error("{kind} file is not readable: {path}: {source}")]
    Unreadable {
        kind: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no {kind} found in {path}")]
    EmptyPem { kind: &'static str, path: PathBuf },

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure to bring the listeners up
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// TLS handshake failure; terminates only the affected connection
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("TLS handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("TLS handshake failed: {0}")]
    Failed(#[source] io::Error),
}

/// Malformed request or frame; terminates only the affected connection
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed HTTP request: {0}")]
    Http(#[from] httparse::Error),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("invalid Content-Length header")]
    InvalidContentLength,

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("unsupported WebSocket frame: {0}")]
    UnsupportedFrame(&'static str),
}

/// Anything that ends a session early
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket transport error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SessionError {
    /// Short label used as the `reason` field in session-end logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Handshake(_) => "handshake",
            SessionError::Protocol(_) => "protocol",
            SessionError::Timeout { .. } => "timeout",
            SessionError::Io(_) => "io",
            SessionError::WebSocket(_) => "websocket",
        }
    }
}
