//! Error taxonomy (spec.md §7): config / fatal-init / per-session / cache.
//!
//! Narrow, data-carrying `thiserror` enums at each module boundary, the
//! way the teacher's `ServerTaskError`/`TcpConnectError` are shaped.
//! `anyhow` is reserved for the process edge (`main.rs`).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Fatal at process startup (spec.md §7 "Config error" / "Fatal init").
#[derive(Debug, Error)]
pub enum InitError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("failed to init logger: {0}")]
    Logger(String),
    #[error("failed to bind {kind} listener on {addr}: {source}")]
    ListenerBind {
        kind: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to init transparent socket cache: {0}")]
    CacheInit(String),
    #[error("worker failed to initialize: {0}")]
    WorkerInit(String),
    #[error("failed to resolve {0}: {1}")]
    Resolve(&'static str, #[source] io::Error),
}

/// Per-session recoverable error (spec.md §7 "Per-session recoverable").
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("client i/o error: {0}")]
    ClientIo(#[source] io::Error),
    #[error("upstream i/o error: {0}")]
    UpstreamIo(#[source] io::Error),
    #[error("socks5 handshake failed: {0}")]
    Socks5(#[from] crate::socks5::SocksError),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("anti-loop: original destination equals listener address")]
    AntiLoop,
    #[error("session terminated by shutdown")]
    Terminated,
}

impl SessionError {
    /// True if the failure should be logged no louder than debug, matching
    /// spec.md §7's "close the session quietly at debug/warn level".
    pub fn is_quiet(&self) -> bool {
        !matches!(self, SessionError::AntiLoop)
    }

    /// Short, stable tag for the structured completion log (spec.md §8
    /// testable properties rely on consistent per-kind labeling).
    pub fn brief(&self) -> &'static str {
        match self {
            SessionError::ClientIo(_) => "client_io",
            SessionError::UpstreamIo(_) => "upstream_io",
            SessionError::Socks5(_) => "socks5",
            SessionError::ConnectTimeout => "connect_timeout",
            SessionError::IdleTimeout => "idle_timeout",
            SessionError::AntiLoop => "anti_loop",
            SessionError::Terminated => "terminated",
        }
    }
}
