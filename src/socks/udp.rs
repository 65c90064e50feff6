//! SOCKS5 UDP ASSOCIATE relay.
//!
//! One task owns the association's UDP socket, its idle deadline and the
//! control connection: datagrams from the client address are unwrapped and
//! forwarded, datagrams from anywhere else are wrapped in SOCKS5 UDP
//! framing and returned to the client. The association ends when the idle
//! deadline passes, the control connection drops, or the session aborts.
//!
//! ```text
//!  +----+------+------+----------+----------+----------+
//!  |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//!  | 2  |  1   |  1   | variable |    2     |    ...   |
//!  +----+------+------+----------+----------+----------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::AsyncReadExt;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::server::ServeContext;
use crate::socks::addr::SocksAddr;
use crate::socks::{reply_v5, REP_GENERAL_FAILURE, REP_SUCCEEDED};
use crate::stream::ProxyStream;

/// Maximum accepted datagram size.
const MAX_DATAGRAM: usize = 1500;

/// Strip the SOCKS5 UDP header; `None` drops the datagram (fragments).
fn unwrap_datagram(buf: &[u8]) -> Result<Option<(SocksAddr, &[u8])>> {
    if buf.len() < 4 {
        return Err(Error::protocol("short udp datagram"));
    }
    let frag = buf[2];
    if frag != 0 {
        // Fragmentation is not supported.
        return Ok(None);
    }
    let (addr, consumed) = SocksAddr::parse(&buf[3..])?;
    Ok(Some((addr, &buf[3 + consumed..])))
}

/// Wrap a datagram from `origin` for delivery to the client. The origin is
/// always encoded as a literal address, never a name.
fn wrap_datagram(origin: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22 + payload.len());
    out.extend_from_slice(&[0x00, 0x00, 0x00]);
    SocksAddr::Ip(origin).encode_into(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Serve a UDP ASSOCIATE request on its control connection.
pub async fn run_associate(
    ctx: &ServeContext,
    mut stream: ProxyStream,
    declared: SocksAddr,
) -> Result<()> {
    let id = ctx.session.id();
    let client_ip = ctx.session.peer_addr().ip();

    // The socket family follows the declared destination; an unspecified
    // declaration falls back to the control connection's family.
    let family_addr = match &declared {
        SocksAddr::Ip(sa) if !sa.ip().is_unspecified() => sa.ip(),
        SocksAddr::Ip(_) => client_ip,
        SocksAddr::Domain(name, port) => {
            match tokio::net::lookup_host((name.as_str(), *port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
            {
                Some(sa) => sa.ip(),
                None => {
                    let zeros = SocksAddr::Ip((Ipv4Addr::UNSPECIFIED, 0).into());
                    reply_v5(&mut stream, REP_GENERAL_FAILURE, &zeros).await?;
                    return Err(Error::resolve(format!("udp target {name}")));
                }
            }
        }
    };

    let bind_addr: SocketAddr = match family_addr {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };

    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            let zeros = SocksAddr::Ip((Ipv4Addr::UNSPECIFIED, 0).into());
            reply_v5(&mut stream, REP_GENERAL_FAILURE, &zeros).await?;
            return Err(e.into());
        }
    };
    let local = socket.local_addr()?;

    tracing::debug!("connection id: {id}, udp associate bound {local}, client {client_ip}");
    reply_v5(&mut stream, REP_SUCCEEDED, &SocksAddr::Ip(local)).await?;

    let expiry = ctx.options.udp_expiry;
    let mut deadline = Instant::now() + expiry;
    let mut last_client: Option<SocketAddr> = None;
    let mut buf = [0u8; MAX_DATAGRAM];
    let mut control = [0u8; 64];
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::debug!("connection id: {id}, udp association expired");
                break;
            }
            _ = ctx.session.closed() => break,
            read = stream.read(&mut control) => match read {
                // Control connection dropped; tear the association down.
                Ok(0) | Err(_) => {
                    tracing::debug!("connection id: {id}, udp control connection closed");
                    break;
                }
                // Stray bytes on the control connection are ignored.
                Ok(_) => continue,
            },
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                deadline = Instant::now() + expiry;

                if from.ip() == client_ip {
                    last_client = Some(from);

                    let (target, payload) = match unwrap_datagram(&buf[..n]) {
                        Ok(Some(parts)) => parts,
                        Ok(None) => continue,
                        Err(_) => continue,
                    };

                    let dest = match target {
                        SocksAddr::Ip(sa) => sa,
                        SocksAddr::Domain(ref name, port) => {
                            match tokio::net::lookup_host((name.as_str(), port)).await {
                                Ok(mut addrs) => match addrs.next() {
                                    Some(sa) => sa,
                                    None => break,
                                },
                                Err(_) => break,
                            }
                        }
                    };

                    total += 1;
                    let _ = socket.send_to(payload, dest).await;
                } else if let Some(client) = last_client {
                    total += 1;
                    let reply = wrap_datagram(from, &buf[..n]);
                    let _ = socket.send_to(&reply, client).await;
                }
            }
        }
    }

    tracing::debug!("connection id: {id}, udp relay quit, {total} datagrams");
    Ok(())
}
