//! Client-role SOCKS5 handshake: greeting, optional user/pass auth, CONNECT
//! or UDP-ASSOCIATE, reply parsing. This is the only role the forwarder
//! ever plays — it dials an upstream SOCKS5 server, never serves one.
//!
//! Grounded on `g3proxy/src/escape/proxy_socks5/socks5_connect/mod.rs`
//! (`v5::client::socks5_connect_to`, `v5::client::socks5_udp_associate`).

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::wire::{self, AuthInfo};
use super::{BoundAddr, ReplyCode, SocksCommand, SocksError};

/// Send greeting (+ user/pass sub-negotiation if configured) and block
/// until the method is agreed. spec.md §4.2.
pub async fn greet<R, W>(r: &mut R, w: &mut W, auth: &AuthInfo) -> Result<(), SocksError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    w.write_all(&wire::encode_greeting(auth.is_some())).await?;
    w.flush().await?;

    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    if hdr[0] != wire::VER {
        return Err(SocksError::BadVersion(hdr[0]));
    }
    match hdr[1] {
        wire::METHOD_NONE => Ok(()),
        wire::METHOD_USER_PASS => {
            if !auth.is_some() {
                return Err(SocksError::UnsupportedAuthMethod(hdr[1]));
            }
            w.write_all(&wire::encode_user_pass(auth)).await?;
            w.flush().await?;
            let mut reply = [0u8; 2];
            r.read_exact(&mut reply).await?;
            if reply[1] != 0x00 {
                return Err(SocksError::AuthRejected(reply[1]));
            }
            Ok(())
        }
        other => Err(SocksError::UnsupportedAuthMethod(other)),
    }
}

/// Read a `{ ver, rep, rsv, atype, addr, port }` reply frame; returns the
/// bound address the upstream reports (informational, spec.md §4.2).
async fn read_reply<R>(r: &mut R) -> Result<BoundAddr, SocksError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 4];
    r.read_exact(&mut hdr).await?;
    if hdr[0] != wire::VER {
        return Err(SocksError::BadVersion(hdr[0]));
    }
    let rep = ReplyCode::from_byte(hdr[1]);

    // atype is hdr[3]; pull the right number of remaining bytes before we
    // even look at rep, so a failure reply still leaves the stream framed
    // correctly for whatever the caller does next (there usually isn't a
    // next, but draining is cheap and correct).
    // spec.md §4.2: a reply names the bound address as IPv4 or IPv6 only;
    // a domain (or anything else) here is a malformed/hostile reply, fatal.
    let atype = hdr[3];
    let mut rest = match atype {
        0x01 => vec![0u8; 4 + 2],
        0x04 => vec![0u8; 16 + 2],
        other => return Err(SocksError::UnsupportedAddressType(other)),
    };
    r.read_exact(&mut rest).await?;

    if !rep.is_success() {
        return Err(SocksError::RequestFailed(rep));
    }

    let mut full = Vec::with_capacity(1 + rest.len());
    full.push(atype);
    full.extend_from_slice(&rest);
    let (bound, _) = wire::decode_address(&full)?;
    Ok(bound)
}

/// Full CONNECT handshake (spec.md §4.5 step 2): greet, then request.
pub async fn connect<R, W>(
    r: &mut R,
    w: &mut W,
    auth: &AuthInfo,
    target: SocketAddr,
) -> Result<BoundAddr, SocksError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    greet(r, w, auth).await?;
    let req = wire::encode_request(SocksCommand::Connect as u8, wire::normalize(target))?;
    w.write_all(&req).await?;
    w.flush().await?;
    read_reply(r).await
}

/// Pipelined CONNECT (spec.md §4.2 "Pipelining"): greeting + auth +
/// request (+ first client byte, if already available) go out in one
/// write before any reply is read. Falls back to the ordinary sequence
/// transparently if the caller has no first byte ready — see
/// `connect_pipelined_or_plain`.
pub async fn connect_pipelined<R, W>(
    r: &mut R,
    w: &mut W,
    auth: &AuthInfo,
    target: SocketAddr,
    first_byte: Option<&[u8]>,
) -> Result<BoundAddr, SocksError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut out = wire::encode_greeting(auth.is_some());
    if auth.is_some() {
        out.extend_from_slice(&wire::encode_user_pass(auth));
    }
    out.extend_from_slice(&wire::encode_request(
        SocksCommand::Connect as u8,
        wire::normalize(target),
    )?);
    if let Some(extra) = first_byte {
        out.extend_from_slice(extra);
    }
    w.write_all(&out).await?;
    w.flush().await?;

    // drain greeting reply
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    if hdr[0] != wire::VER {
        return Err(SocksError::BadVersion(hdr[0]));
    }
    if hdr[1] == wire::METHOD_USER_PASS {
        let mut reply = [0u8; 2];
        r.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(SocksError::AuthRejected(reply[1]));
        }
    } else if hdr[1] != wire::METHOD_NONE {
        return Err(SocksError::UnsupportedAuthMethod(hdr[1]));
    }
    read_reply(r).await
}

/// UDP-ASSOCIATE handshake (spec.md §4.2/§4.6): the client announces the
/// local address/port it will send UDP from (often `0.0.0.0:0`), and the
/// server replies with the relay address to send datagrams to.
pub async fn udp_associate<R, W>(
    r: &mut R,
    w: &mut W,
    auth: &AuthInfo,
    local_udp_addr: SocketAddr,
) -> Result<BoundAddr, SocksError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    greet(r, w, auth).await?;
    let req = wire::encode_request(SocksCommand::UdpAssociate as u8, local_udp_addr)?;
    w.write_all(&req).await?;
    w.flush().await?;
    read_reply(r).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_reply_accepts_ipv4_bound_address() {
        let (mut server, mut client) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server
                .write_all(&[wire::VER, 0x00, 0x00, 0x01, 10, 0, 0, 1, 0, 80])
                .await
                .unwrap();
        });
        let bound = read_reply(&mut client).await.unwrap();
        assert_eq!(bound, "10.0.0.1:80".parse().unwrap());
    }

    #[tokio::test]
    async fn read_reply_rejects_domain_atype_as_fatal() {
        let (mut server, mut client) = tokio::io::duplex(64);
        tokio::spawn(async move {
            // ver, rep=succeeded, rsv, atype=domain, then len+domain+port
            server.write_all(&[wire::VER, 0x00, 0x00, 0x03]).await.unwrap();
            server.write_all(&[3, b'f', b'o', b'o', 0, 80]).await.unwrap();
        });
        let err = read_reply(&mut client).await.unwrap_err();
        assert!(matches!(err, SocksError::UnsupportedAddressType(0x03)));
    }
}
