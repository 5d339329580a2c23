//! SOCKS5 wire protocol layer (spec.md §4.2, L2).
//!
//! This is a *client*-role codec only: the forwarder always dials an
//! upstream SOCKS5 server, it never terminates inbound SOCKS5. Grounded on
//! the teacher's `g3-socks::v5` usage in
//! `g3proxy/src/escape/proxy_socks5/socks5_connect/mod.rs` and
//! `.../udp_relay/{send,recv}.rs`.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub mod client;
pub mod wire;

pub use wire::{AuthInfo, UdpHeader};

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("i/o error talking to upstream: {0}")]
    Io(#[from] io::Error),
    #[error("upstream selected an unsupported auth method (0x{0:02x})")]
    UnsupportedAuthMethod(u8),
    #[error("user/pass authentication rejected by upstream (status {0})")]
    AuthRejected(u8),
    #[error("upstream replied with an unexpected socks version (0x{0:02x})")]
    BadVersion(u8),
    #[error("upstream rejected the request: {0:?}")]
    RequestFailed(ReplyCode),
    #[error("unsupported address type in reply: 0x{0:02x}")]
    UnsupportedAddressType(u8),
    #[error("domain name too long to encode ({0} bytes)")]
    DomainTooLong(usize),
    #[error("truncated socks5 message")]
    Truncated,
}

/// SOCKS5 reply codes (RFC 1928 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl ReplyCode {
    pub fn from_byte(b: u8) -> ReplyCode {
        match b {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::NotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReplyCode::Succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

/// Outcome of a successful CONNECT: the address the upstream bound on its
/// side, informational only (spec.md §4.2 "Reply parsing strips the bound
/// address").
pub type BoundAddr = SocketAddr;
