//! SOCKS5 address codec.
//!
//! ATYP 0x01 IPv4, 0x03 domain (length-prefixed), 0x04 IPv6; always followed
//! by a big-endian port. Shared by the request parser, the UDP datagram
//! framing, and the chain client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A SOCKS destination: literal socket address or a name to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    /// Read `ATYP ADDR PORT` from the stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        Self::read_body(reader, atyp).await
    }

    /// Read `ADDR PORT` when the ATYP byte was already consumed.
    pub async fn read_body<R>(reader: &mut R, atyp: u8) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(SocksAddr::Ip(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(octets)),
                    port,
                )))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(Error::protocol("zero-length domain"));
                }
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                let port = reader.read_u16().await?;
                let name = String::from_utf8(name)
                    .map_err(|_| Error::protocol("domain is not valid UTF-8"))?;
                Ok(SocksAddr::Domain(name, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                let port = reader.read_u16().await?;
                Ok(SocksAddr::Ip(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            other => Err(Error::protocol(format!("unsupported ATYP {other:#04x}"))),
        }
    }

    /// Decode from an in-memory buffer, returning the consumed length.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        let short = || Error::protocol("truncated socks address");

        let atyp = *buf.first().ok_or_else(short)?;
        match atyp {
            ATYP_IPV4 => {
                let rest = buf.get(1..7).ok_or_else(short)?;
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&rest[..4]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Ok((
                    SocksAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port)),
                    7,
                ))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                if len == 0 {
                    return Err(Error::protocol("zero-length domain"));
                }
                let rest = buf.get(2..2 + len + 2).ok_or_else(short)?;
                let name = String::from_utf8(rest[..len].to_vec())
                    .map_err(|_| Error::protocol("domain is not valid UTF-8"))?;
                let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
                Ok((SocksAddr::Domain(name, port), 2 + len + 2))
            }
            ATYP_IPV6 => {
                let rest = buf.get(1..19).ok_or_else(short)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Ok((
                    SocksAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            other => Err(Error::protocol(format!("unsupported ATYP {other:#04x}"))),
        }
    }

    /// Append `ATYP ADDR PORT` to a buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            SocksAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            SocksAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            SocksAddr::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Write `ATYP ADDR PORT` to the stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::with_capacity(22);
        self.encode_into(&mut buf);
        writer.write_all(&buf).await?;
        Ok(())
    }

    /// Host part for connector input.
    pub fn host(&self) -> String {
        match self {
            SocksAddr::Ip(addr) => addr.ip().to_string(),
            SocksAddr::Domain(name, _) => name.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            SocksAddr::Ip(addr) => addr.port(),
            SocksAddr::Domain(_, port) => *port,
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, SocksAddr::Domain(..))
    }
}

impl std::fmt::Display for SocksAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksAddr::Ip(addr) => write!(f, "{addr}"),
            SocksAddr::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}
