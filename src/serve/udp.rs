//! M3 UDP session (spec.md §4.6): one session per client source
//! address, queuing inbound datagrams and running two fused forward/
//! backward loops over a single SOCKS5 UDP-ASSOCIATE.
//!
//! Grounded on `g3proxy/src/serve/socks_proxy/task/udp_associate/task.rs`
//! for the associate-then-relay task shape, and
//! `original_source/src/hev-socks5-session-udp.c` for the liveness-bit
//! and queue-overflow semantics the teacher's HTTP-family UDP task
//! doesn't need.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};

use super::Shared;
use crate::addr;
use crate::config::UdpMode;
use crate::error::SessionError;
use crate::socket::factory;
use crate::socks5::wire::UdpHeader;
use crate::socks5::{client, SocksCommand};

/// Bound on queued-but-not-yet-forwarded frames per session
/// (`original_source/src/hev-config-const.h`, `UDP_POOL_SIZE`).
const UDP_POOL_SIZE: usize = 512;
const UDP_BUF_SIZE: usize = 1500;

pub struct Frame {
    pub dst: SocketAddr,
    pub payload: Bytes,
}

/// Routes inbound datagrams, demultiplexed by client source address, to
/// a per-source session task, spawning a new one on first sight
/// (spec.md §4.6 "dispatch").
pub struct UdpDispatch {
    sessions: Mutex<HashMap<SocketAddr, mpsc::Sender<Frame>>>,
    tasks: Mutex<JoinSet<()>>,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
}

impl UdpDispatch {
    pub fn new(shared: Arc<Shared>, stop_rx: watch::Receiver<bool>) -> Self {
        UdpDispatch {
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shared,
            stop_rx,
        }
    }

    /// Enqueue one datagram, spawning its session if `src` is new.
    /// Queue-full drops the datagram with a warning (spec.md §4.6,
    /// §7 "per-datagram transient").
    pub async fn dispatch(self: &Arc<Self>, src: SocketAddr, dst: SocketAddr, payload: Bytes) {
        let mut sessions = self.sessions.lock().await;
        if let Some(tx) = sessions.get(&src) {
            if tx.try_send(Frame { dst, payload }).is_err() {
                warn!("udp session {src}: queue full, dropping datagram to {dst}");
            }
            return;
        }

        let (tx, rx) = mpsc::channel(UDP_POOL_SIZE);
        let _ = tx.try_send(Frame { dst, payload });
        sessions.insert(src, tx);
        drop(sessions);

        let this = self.clone();
        let stop_rx = self.stop_rx.clone();
        self.tasks.lock().await.spawn(async move {
            run_session(src, rx, this.shared.clone(), stop_rx).await;
            this.sessions.lock().await.remove(&src);
        });
    }

    /// Await every session this dispatcher has spawned, letting each
    /// drain on its own shutdown signal rather than aborting it
    /// (spec.md §4.8 "iterate their session sets and call terminate").
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
    }
}

#[derive(Default)]
struct Liveness {
    forward_ever_ok: bool,
    backward_ever_ok: bool,
    frames_forwarded: u64,
    frames_replied: u64,
}

impl Liveness {
    fn new() -> Self {
        Liveness::default()
    }

    fn both_dead_after_timeout(&self) -> bool {
        !self.forward_ever_ok && !self.backward_ever_ok
    }
}

async fn run_session(
    source_addr: SocketAddr,
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
) {
    let started = std::time::Instant::now();
    let mut liveness = Liveness::new();

    let result = serve(source_addr, rx, &shared, &mut liveness, stop_rx).await;
    match &result {
        Ok(()) => debug!("udp session {source_addr}: closed"),
        Err(e) if e.is_quiet() => debug!("udp session {source_addr}: {e}"),
        Err(e) => warn!("udp session {source_addr}: {e}"),
    }

    crate::log::task::UdpSessionLog {
        source_addr,
        total_time: started.elapsed(),
        frames_forwarded: liveness.frames_forwarded,
        frames_replied: liveness.frames_replied,
        outcome: result.as_ref().err().map(SessionError::brief).unwrap_or("ok"),
    }
    .log(&shared.logger);
}

enum Transport {
    Tcp,
    Udp {
        socket: UdpSocket,
        target: SocketAddr,
    },
}

async fn serve(
    source_addr: SocketAddr,
    mut rx: mpsc::Receiver<Frame>,
    shared: &Shared,
    liveness: &mut Liveness,
    stop_rx: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let connect_deadline = shared.connect_timeout();

    let mut control = timeout(connect_deadline, TcpStream::connect(shared.socks5_addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout)?
        .map_err(SessionError::UpstreamIo)?;

    if shared.mark != 0 {
        let sock_ref = socket2::SockRef::from(&control);
        let _ = factory::set_mark(&sock_ref, shared.mark);
    }

    let local_udp_addr: SocketAddr = "[::]:0".parse().unwrap();
    let bound = timeout(
        connect_deadline,
        client::udp_associate(&mut control, &mut control, &shared.auth, local_udp_addr),
    )
    .await
    .map_err(|_| SessionError::ConnectTimeout)??;

    let transport = match shared.udp_mode {
        UdpMode::Tcp => Transport::Tcp,
        UdpMode::Udp => {
            let std_socket = socket2::Socket::new(
                socket2::Domain::IPV6,
                socket2::Type::DGRAM,
                None,
            )
            .map_err(SessionError::UpstreamIo)?;
            std_socket
                .bind(&"[::]:0".parse::<SocketAddr>().unwrap().into())
                .map_err(SessionError::UpstreamIo)?;
            if shared.mark != 0 {
                let _ = factory::set_mark(&std_socket, shared.mark);
            }
            std_socket.set_nonblocking(true).map_err(SessionError::UpstreamIo)?;
            let socket = UdpSocket::from_std(std_socket.into()).map_err(SessionError::UpstreamIo)?;

            let target = match &shared.udp_relay_addr {
                Some(host) => super::resolve_one(host, bound.port())
                    .await
                    .map_err(SessionError::UpstreamIo)?,
                None => bound,
            };
            Transport::Udp { socket, target }
        }
    };

    relay(source_addr, &mut control, transport, &mut rx, shared, liveness, stop_rx).await
}

/// Races forward/backward datagram flow against idle timeout, the
/// control-channel liveness probe, and the process-wide shutdown signal
/// so a worker quit drains this session instead of aborting it
/// mid-relay (spec.md §4.8, §9 invariant 5).
async fn relay(
    source_addr: SocketAddr,
    control: &mut TcpStream,
    transport: Transport,
    rx: &mut mpsc::Receiver<Frame>,
    shared: &Shared,
    liveness: &mut Liveness,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    if *stop_rx.borrow() {
        return Err(SessionError::Terminated);
    }

    let idle = shared.read_write_timeout();
    let mut recv_buf = vec![0u8; UDP_BUF_SIZE];
    let mut control_probe = vec![0u8; 1];
    let mut control_check = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return Err(SessionError::Terminated);
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match forward_one(control, &transport, &frame).await {
                    Ok(()) => {
                        liveness.forward_ever_ok = true;
                        liveness.frames_forwarded += 1;
                    }
                    Err(e) if liveness.forward_ever_ok => {
                        debug!("udp session {source_addr}: forward error after prior success: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            res = backward_one(control, &transport, &mut recv_buf) => {
                let (reply_dst, payload) = res?;
                liveness.backward_ever_ok = true;
                liveness.frames_replied += 1;
                if let Err(e) = reply_via_tsock(shared, reply_dst, source_addr, &payload).await {
                    warn!("udp session {source_addr}: reply via tsock for {reply_dst} failed: {e}");
                }
            }
            _ = control_check.tick(), if matches!(transport, Transport::Udp { .. }) => {
                match control.try_read(&mut control_probe) {
                    Ok(0) => return Err(SessionError::Terminated),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(SessionError::UpstreamIo(e)),
                }
            }
            _ = tokio::time::sleep(idle) => {
                if liveness.both_dead_after_timeout() {
                    return Err(SessionError::IdleTimeout);
                }
                // at least one direction has ever made progress; keep the
                // session open per spec.md §4.6 liveness rule and reset.
            }
        }
    }
}

async fn forward_one(
    control: &mut TcpStream,
    transport: &Transport,
    frame: &Frame,
) -> Result<(), SessionError> {
    use tokio::io::AsyncWriteExt;

    match transport {
        Transport::Tcp => {
            let framed = UdpHeader::encode_framed(frame.dst, &frame.payload)?;
            control.write_all(&framed).await.map_err(SessionError::UpstreamIo)?;
            Ok(())
        }
        Transport::Udp { socket, target } => {
            let mut wrapped = UdpHeader::encode(frame.dst)?;
            wrapped.extend_from_slice(&frame.payload);
            socket
                .send_to(&wrapped, *target)
                .await
                .map_err(SessionError::UpstreamIo)?;
            Ok(())
        }
    }
}

async fn backward_one(
    control: &mut TcpStream,
    transport: &Transport,
    buf: &mut [u8],
) -> Result<(SocketAddr, Vec<u8>), SessionError> {
    use tokio::io::AsyncReadExt;

    match transport {
        Transport::Tcp => {
            let mut len_buf = [0u8; 2];
            control.read_exact(&mut len_buf).await.map_err(SessionError::UpstreamIo)?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            control.read_exact(&mut frame).await.map_err(SessionError::UpstreamIo)?;
            let (src, consumed) = crate::socks5::wire::decode_address(&frame)?;
            Ok((src, frame[consumed..].to_vec()))
        }
        Transport::Udp { socket, .. } => {
            let n = socket.recv(buf).await.map_err(SessionError::UpstreamIo)?;
            let (src, consumed) = UdpHeader::decode(&buf[..n])?;
            Ok((src, buf[consumed..n].to_vec()))
        }
    }
}

/// Send `payload` to `session_source` from a transparent socket bound to
/// `reply_dst`, via the L3 cache (spec.md §4.3/§4.6 "reply path").
async fn reply_via_tsock(
    shared: &Shared,
    reply_dst: SocketAddr,
    session_source: SocketAddr,
    payload: &[u8],
) -> std::io::Result<()> {
    let reply_dst = addr::unmap(addr::to_mapped(reply_dst));
    let lease = shared.tsock.get(reply_dst).await?;
    lease.socket().send_to(payload, session_source).await?;
    Ok(())
}

#[allow(dead_code)]
fn udp_command() -> u8 {
    SocksCommand::UdpAssociate as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_drops_datagrams_past_queue_capacity() {
        // exercises only the bounded-channel overflow path, not the
        // spawned session (which needs a live SOCKS5 upstream); build a
        // channel directly at the same capacity the dispatcher uses.
        let (tx, mut rx) = mpsc::channel::<Frame>(2);
        let dst: SocketAddr = "127.0.0.1:53".parse().unwrap();
        assert!(tx
            .try_send(Frame {
                dst,
                payload: Bytes::from_static(b"a")
            })
            .is_ok());
        assert!(tx
            .try_send(Frame {
                dst,
                payload: Bytes::from_static(b"b")
            })
            .is_ok());
        assert!(tx
            .try_send(Frame {
                dst,
                payload: Bytes::from_static(b"c")
            })
            .is_err());
        rx.close();
    }
}
