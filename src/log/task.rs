//! Structured per-session completion records, logged once a session has
//! fully closed. Unstructured tracing (accept-loop noise, per-datagram
//! drops) stays on the `log` facade in the modules that emit it; this is
//! only the one-line-per-session summary.
//!
//! Grounded on `g3proxy/src/log/task/tcp_connect.rs`
//! (`TaskLogForTcpConnect::log`, `slog_info!` with a flat key/value set),
//! trimmed to the fields this forwarder actually has (no user/escaper
//! notions, since there is exactly one upstream).

use std::net::SocketAddr;
use std::time::Duration;

use slog::{slog_info, Logger};

/// Completion record for one M2 TCP session (spec.md §4.5).
pub struct TcpSessionLog<'a> {
    pub client_addr: SocketAddr,
    pub target_addr: SocketAddr,
    pub total_time: Duration,
    pub client_to_upstream_bytes: u64,
    pub upstream_to_client_bytes: u64,
    pub outcome: &'a str,
}

impl TcpSessionLog<'_> {
    pub fn log(&self, logger: &Logger) {
        slog_info!(logger, "tcp session closed";
            "task_type" => "TcpConnect",
            "client_addr" => self.client_addr,
            "target_addr" => self.target_addr,
            "total_time_ms" => self.total_time.as_millis() as u64,
            "c2u_bytes" => self.client_to_upstream_bytes,
            "u2c_bytes" => self.upstream_to_client_bytes,
            "outcome" => self.outcome,
        );
    }
}

/// Completion record for one M3 UDP session (spec.md §4.6).
pub struct UdpSessionLog<'a> {
    pub source_addr: SocketAddr,
    pub total_time: Duration,
    pub frames_forwarded: u64,
    pub frames_replied: u64,
    pub outcome: &'a str,
}

impl UdpSessionLog<'_> {
    pub fn log(&self, logger: &Logger) {
        slog_info!(logger, "udp session closed";
            "task_type" => "UdpAssociate",
            "source_addr" => self.source_addr,
            "total_time_ms" => self.total_time.as_millis() as u64,
            "frames_forwarded" => self.frames_forwarded,
            "frames_replied" => self.frames_replied,
            "outcome" => self.outcome,
        );
    }
}

/// Completion record for one M4 DNS session (spec.md §4.7).
pub struct DnsSessionLog<'a> {
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub total_time: Duration,
    pub outcome: &'a str,
}

impl DnsSessionLog<'_> {
    pub fn log(&self, logger: &Logger) {
        slog_info!(logger, "dns session closed";
            "task_type" => "DnsQuery",
            "client_addr" => self.client_addr,
            "upstream_addr" => self.upstream_addr,
            "total_time_ms" => self.total_time.as_millis() as u64,
            "outcome" => self.outcome,
        );
    }
}
