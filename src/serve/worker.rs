//! T1 Worker (spec.md §4.8, Data Model §3 `Worker`): binds this worker's
//! three listening sockets, accepts/demultiplexes, spawns sessions, and
//! drains them on shutdown.
//!
//! Grounded on `original_source/src/hev-socks5-worker.c`
//! (`hev_socks5_worker_start`'s per-kind task setup, `is_main` controlling
//! `SO_REUSEPORT` strictness) and `g3proxy/src/serve/runtime/
//! ordinary_tcp_port.rs` (`TcpListener::from_std` after building the
//! listening socket with the raw option layer, then `tokio::spawn` per
//! accepted connection).

use std::net::SocketAddr;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use bytes::Bytes;
use log::{info, warn};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::socket::factory::{self, SocketKind};
use crate::socket::original_dst;

use super::udp::UdpDispatch;
use super::Shared;

/// One worker OS thread's listener set (spec.md §3 `Worker`:
/// `tcp_task?, udp_task?, dns_task?, event_task`).
pub struct Worker {
    pub id: usize,
    pub is_main: bool,
}

impl Worker {
    /// Binds whichever of TCP/UDP/DNS are configured, reports the bind
    /// outcome on `ready` (consumed by the controller to decide whether
    /// init succeeded, spec.md §7 "Fatal init"), then runs every
    /// listener loop concurrently until `stop_rx` reports shutdown.
    /// Returns once all listener loops have exited (spec.md §9 invariant
    /// "quit → all listener loops eventually exit").
    pub async fn run(
        self,
        config: Arc<Config>,
        shared: Arc<Shared>,
        stop_rx: watch::Receiver<bool>,
        ready: std_mpsc::Sender<Result<(), String>>,
    ) -> std::io::Result<()> {
        let mut loops = match self.bind_and_spawn(&config, &shared, &stop_rx).await {
            Ok(loops) => {
                let _ = ready.send(Ok(()));
                loops
            }
            Err(e) => {
                let _ = ready.send(Err(e.to_string()));
                return Err(e);
            }
        };

        let worker_log = crate::log::worker_logger(&shared.logger, self.id);
        slog::slog_info!(worker_log, "worker started"; "is_main" => self.is_main, "listeners" => loops.len());

        while loops.join_next().await.is_some() {}
        info!("worker {}: all listener loops exited", self.id);
        Ok(())
    }

    async fn bind_and_spawn(
        &self,
        config: &Arc<Config>,
        shared: &Arc<Shared>,
        stop_rx: &watch::Receiver<bool>,
    ) -> std::io::Result<JoinSet<()>> {
        // non-main workers require their own kernel accept queue
        // (SO_REUSEPORT failure is fatal); the main worker tolerates a
        // single shared queue (spec.md §4.4).
        let force_reuseport = !self.is_main;
        let mut loops = JoinSet::new();

        if let Some(tcp_cfg) = &config.tcp {
            let listen_addr = super::resolve_one(&tcp_cfg.address, tcp_cfg.port).await?;
            let socket = factory::bind_listener(
                listen_addr,
                SocketKind::Stream,
                force_reuseport,
                shared.udp_recv_buffer_size,
            )?;
            socket.set_nonblocking(true)?;
            let listener = TcpListener::from_std(socket.into())?;
            let shared = shared.clone();
            let mut stop_rx = stop_rx.clone();
            loops.spawn(async move { accept_tcp(listener, listen_addr, shared, &mut stop_rx).await });
        }

        if let Some(udp_cfg) = &config.udp {
            let listen_addr = super::resolve_one(&udp_cfg.address, udp_cfg.port).await?;
            let socket = factory::bind_listener(
                listen_addr,
                SocketKind::Dgram,
                force_reuseport,
                shared.udp_recv_buffer_size,
            )?;
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket.into())?;
            let shared = shared.clone();
            let mut stop_rx = stop_rx.clone();
            loops.spawn(async move { recv_udp(socket, shared, &mut stop_rx).await });
        }

        if let Some(dns_cfg) = &config.dns {
            let listen_addr = super::resolve_one(&dns_cfg.address, dns_cfg.port).await?;
            let upstream_addr = super::resolve_one(&dns_cfg.upstream, 53).await?;
            let socket = factory::bind_listener(
                listen_addr,
                SocketKind::Dgram,
                force_reuseport,
                shared.udp_recv_buffer_size,
            )?;
            socket.set_nonblocking(true)?;
            let socket = UdpSocket::from_std(socket.into())?;
            let shared = shared.clone();
            let mut stop_rx = stop_rx.clone();
            loops.spawn(async move { recv_dns(socket, upstream_addr, shared, &mut stop_rx).await });
        }

        if loops.is_empty() {
            warn!("worker {}: no listener configured, nothing to run", self.id);
        }

        Ok(loops)
    }
}

async fn accept_tcp(
    listener: TcpListener,
    listen_addr: SocketAddr,
    shared: Arc<Shared>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, _peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("tcp listener {listen_addr}: accept error: {e}");
                        continue;
                    }
                };
                let shared = shared.clone();
                let stop_rx = stop_rx.clone();
                sessions.spawn(async move {
                    super::tcp::run(stream, listen_addr, shared, stop_rx).await;
                });
            }
        }
    }

    // drain in-flight sessions: each already holds its own clone of
    // `stop_rx`, so it is already unwinding toward Terminated.
    while sessions.join_next().await.is_some() {}
}

/// One recv loop demultiplexing by source address into per-source UDP
/// sessions (spec.md §4.6 "Dispatch").
async fn recv_udp(socket: UdpSocket, shared: Arc<Shared>, stop_rx: &mut watch::Receiver<bool>) {
    let dispatch = Arc::new(UdpDispatch::new(shared, stop_rx.clone()));
    let mut buf = vec![0u8; 1500];

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            res = original_dst::recv_with_orig_dst(&socket, &mut buf) => {
                match res {
                    Ok(dgram) => {
                        let (src, dst) = original_dst::normalize_endpoints(&dgram);
                        let payload = Bytes::copy_from_slice(&buf[..dgram.len]);
                        dispatch.dispatch(src, dst, payload).await;
                    }
                    Err(e) => warn!("udp listener: recv error: {e}"),
                }
            }
        }
    }

    // each session already holds its own `stop_rx` clone taken at spawn
    // time, so it is already unwinding toward Terminated.
    dispatch.drain().await;
}

/// One recv loop spawning a one-shot M4 session per datagram (spec.md
/// §4.7).
async fn recv_dns(
    socket: UdpSocket,
    upstream: SocketAddr,
    shared: Arc<Shared>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 1500];
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    break;
                }
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            res = original_dst::recv_with_orig_dst(&socket, &mut buf) => {
                match res {
                    Ok(dgram) => {
                        let (src, dst) = original_dst::normalize_endpoints(&dgram);
                        let query = buf[..dgram.len].to_vec();
                        let shared = shared.clone();
                        let stop_rx = stop_rx.clone();
                        sessions.spawn(async move {
                            super::dns::run(src, dst, query, upstream, &shared, stop_rx).await;
                        });
                    }
                    Err(e) => warn!("dns listener: recv error: {e}"),
                }
            }
        }
    }

    while sessions.join_next().await.is_some() {}
}
