//! M2 TCP session (spec.md §4.5): recover the original destination,
//! CONNECT through the upstream SOCKS5 server, then full-duplex splice
//! with an idle timeout.
//!
//! Grounded on `g3proxy/src/serve/tcp_tproxy/task.rs` (init → connect →
//! relay → close shape); the relay loop itself is a from-scratch
//! `tokio::select!` splice since the teacher's `transit_transparent`
//! lives in the filtered-out `g3-io-ext` crate.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use super::Shared;
use crate::addr;
use crate::error::SessionError;
use crate::log::task::TcpSessionLog;
use crate::socket::{factory, original_dst};
use crate::socks5::client;

/// Byte/address bookkeeping filled in as a session progresses, read back
/// by `run` for the completion log regardless of where the session
/// stopped.
#[derive(Default)]
struct Stats {
    target_addr: Option<SocketAddr>,
    client_to_upstream_bytes: u64,
    upstream_to_client_bytes: u64,
}

/// Run one TCP session end to end; all errors are absorbed and logged
/// here per spec.md §4.5 "errors during greet/connect close the session
/// silently". `stop_rx` carries the process-wide shutdown signal in so
/// the relay loop can drain and self-free instead of being hard-aborted
/// (spec.md §4.8, §5).
pub async fn run(
    client_stream: TcpStream,
    listen_addr: SocketAddr,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<bool>,
) {
    let peer = client_stream.peer_addr().ok();
    let started = Instant::now();
    let mut stats = Stats::default();

    let result = serve(client_stream, listen_addr, &shared, &mut stats, stop_rx).await;
    match &result {
        Ok(()) => debug!("tcp session {peer:?}: closed"),
        Err(e) if e.is_quiet() => debug!("tcp session {peer:?}: {e}"),
        Err(e) => warn!("tcp session {peer:?}: {e}"),
    }

    if let (Some(client_addr), Some(target_addr)) = (peer, stats.target_addr) {
        TcpSessionLog {
            client_addr,
            target_addr,
            total_time: started.elapsed(),
            client_to_upstream_bytes: stats.client_to_upstream_bytes,
            upstream_to_client_bytes: stats.upstream_to_client_bytes,
            outcome: result.as_ref().err().map(SessionError::brief).unwrap_or("ok"),
        }
        .log(&shared.logger);
    }
}

async fn serve(
    mut client_stream: TcpStream,
    listen_addr: SocketAddr,
    shared: &Shared,
    stats: &mut Stats,
    stop_rx: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let original_dst = original_dst::tcp_original_dst(&client_stream).map_err(SessionError::ClientIo)?;
    let original_dst = addr::unmap(addr::to_mapped(original_dst));
    let listen_addr = addr::unmap(addr::to_mapped(listen_addr));
    stats.target_addr = Some(original_dst);
    if original_dst == listen_addr {
        return Err(SessionError::AntiLoop);
    }

    let connect_deadline = shared.connect_timeout();

    let mut upstream = timeout(connect_deadline, TcpStream::connect(shared.socks5_addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout)?
        .map_err(SessionError::UpstreamIo)?;

    if shared.mark != 0 {
        let sock_ref = SockRef::from(&upstream);
        let _ = factory::set_mark(&sock_ref, shared.mark);
    }

    // "already buffered" pipelining: a non-blocking peek, never a wait,
    // since TPROXY-intercepted clients commonly have their first
    // request byte sitting in the socket buffer by the time we get here.
    let mut first_byte = [0u8; 1];
    let pipelined_byte = if shared.pipeline {
        match client_stream.try_read(&mut first_byte) {
            Ok(1) => Some(&first_byte[..]),
            _ => None,
        }
    } else {
        None
    };

    let handshake = async {
        if shared.pipeline {
            client::connect_pipelined(
                &mut upstream,
                &mut upstream,
                &shared.auth,
                original_dst,
                pipelined_byte,
            )
            .await
        } else {
            client::connect(&mut upstream, &mut upstream, &shared.auth, original_dst).await
        }
    };
    timeout(connect_deadline, handshake)
        .await
        .map_err(|_| SessionError::ConnectTimeout)??;

    relay(client_stream, upstream, shared.read_write_timeout(), stats, stop_rx).await
}

/// Full-duplex byte splice with an idle timeout reset on any transfer in
/// either direction (spec.md §4.5 step 3). Also races the shutdown
/// signal so a worker quit drains this session instead of aborting it
/// mid-splice (spec.md §4.8, §9 invariant 5).
async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    idle: Duration,
    stats: &mut Stats,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    if *stop_rx.borrow() {
        return Err(SessionError::Terminated);
    }

    let (mut cr, mut cw) = client.into_split();
    let (mut ur, mut uw) = upstream.into_split();

    let mut client_open = true;
    let mut upstream_open = true;
    let mut buf_c = vec![0u8; 16 * 1024];
    let mut buf_u = vec![0u8; 16 * 1024];

    while client_open || upstream_open {
        tokio::select! {
            _ = stop_rx.changed() => {
                if *stop_rx.borrow() {
                    return Err(SessionError::Terminated);
                }
            }
            res = cr.read(&mut buf_c), if client_open => {
                match timeout_result(res)? {
                    0 => {
                        client_open = false;
                        let _ = uw.shutdown().await;
                    }
                    n => {
                        uw.write_all(&buf_c[..n]).await.map_err(SessionError::UpstreamIo)?;
                        stats.client_to_upstream_bytes += n as u64;
                    }
                }
            }
            res = ur.read(&mut buf_u), if upstream_open => {
                match timeout_result(res)? {
                    0 => {
                        upstream_open = false;
                        let _ = cw.shutdown().await;
                    }
                    n => {
                        cw.write_all(&buf_u[..n]).await.map_err(SessionError::ClientIo)?;
                        stats.upstream_to_client_bytes += n as u64;
                    }
                }
            }
            _ = tokio::time::sleep(idle) => {
                return Err(SessionError::IdleTimeout);
            }
        }
    }

    Ok(())
}

fn timeout_result(res: std::io::Result<usize>) -> Result<usize, SessionError> {
    res.map_err(SessionError::ClientIo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_res, connect_res) = tokio::join!(listener.accept(), connect);
        (accept_res.unwrap().0, connect_res.unwrap())
    }

    #[tokio::test]
    async fn relay_copies_bytes_both_ways_then_closes_on_eof() {
        let (client_side, mut client_remote) = loopback_pair().await;
        let (upstream_side, mut upstream_remote) = loopback_pair().await;

        let (_stop_tx, stop_rx) = watch::channel(false);
        let relay_fut = tokio::spawn(async move {
            let mut stats = Stats::default();
            let result = relay(client_side, upstream_side, Duration::from_secs(5), &mut stats, stop_rx).await;
            (result, stats)
        });

        client_remote.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_remote.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_remote);
        drop(upstream_remote);
        let (result, stats) = relay_fut.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(stats.client_to_upstream_bytes, 4);
        assert_eq!(stats.upstream_to_client_bytes, 4);
    }

    #[tokio::test]
    async fn relay_times_out_when_no_side_ever_speaks() {
        let (client_side, _client_remote) = loopback_pair().await;
        let (upstream_side, _upstream_remote) = loopback_pair().await;

        let mut stats = Stats::default();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let result = relay(client_side, upstream_side, Duration::from_millis(50), &mut stats, stop_rx).await;
        assert!(matches!(result, Err(SessionError::IdleTimeout)));
    }

    #[tokio::test]
    async fn relay_terminates_when_shutdown_signalled() {
        let (client_side, _client_remote) = loopback_pair().await;
        let (upstream_side, _upstream_remote) = loopback_pair().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let relay_fut = tokio::spawn(async move {
            let mut stats = Stats::default();
            relay(client_side, upstream_side, Duration::from_secs(5), &mut stats, stop_rx).await
        });

        stop_tx.send(true).unwrap();
        let result = relay_fut.await.unwrap();
        assert!(matches!(result, Err(SessionError::Terminated)));
    }
}
