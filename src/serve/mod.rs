//! Session layer: M2 TCP, M3 UDP, M4 DNS (spec.md §4.5–§4.7), plus the
//! shared per-worker context each of them runs under.
//!
//! Grounded on `g3proxy/src/serve/tcp_tproxy/` (session shape: init →
//! connect → relay → close) and `g3proxy/src/serve/socks_proxy/task/`
//! (UDP associate task structure), scaled down to one upstream and one
//! protocol instead of the teacher's pluggable escaper/audit stack.

pub mod dns;
pub mod tcp;
pub mod udp;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use slog::Logger;

use crate::config::Config;
use crate::socks5::AuthInfo;
use crate::tsock::TsockCache;

/// Resolved, process-lifetime-immutable session parameters shared by
/// every worker and every session it spawns (spec.md §9 "global cache
/// singletons... created in tproxy_init, passed by reference to every
/// worker").
pub struct Shared {
    pub socks5_addr: SocketAddr,
    pub auth: AuthInfo,
    pub udp_mode: crate::config::UdpMode,
    pub udp_relay_addr: Option<String>,
    pub pipeline: bool,
    pub mark: u32,
    pub connect_timeout_ms: u64,
    pub read_write_timeout_ms: u64,
    pub udp_recv_buffer_size: usize,
    pub tsock: TsockCache,
    pub logger: Logger,
}

impl Shared {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.read_write_timeout_ms)
    }
}

/// Builds the immutable [`Shared`] context once at worker startup, after
/// hostname resolution (spec.md §6.2 "addresses may be... hostnames").
pub async fn build_shared(config: &Config, logger: Logger) -> std::io::Result<Arc<Shared>> {
    let socks5_addr = resolve_one(&config.socks5.address, config.socks5.port).await?;
    Ok(Arc::new(Shared {
        socks5_addr,
        auth: AuthInfo {
            username: config.socks5.username.clone(),
            password: config.socks5.password.clone(),
        },
        udp_mode: config.socks5.udp,
        udp_relay_addr: config.socks5.udp_addr.clone(),
        pipeline: config.socks5.pipeline,
        mark: config.socks5.mark,
        connect_timeout_ms: config.misc.connect_timeout_ms,
        read_write_timeout_ms: config.misc.read_write_timeout_ms,
        udp_recv_buffer_size: config.misc.udp_recv_buffer_size,
        tsock: TsockCache::new(),
        logger,
    }))
}

pub(crate) async fn resolve_one(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
}
