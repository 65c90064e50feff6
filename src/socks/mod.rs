//! SOCKS4/4a and SOCKS5 server-side negotiation.
//!
//! The dispatcher hands over the stream with the version byte still
//! unconsumed. SOCKS5 runs greeting, optional RFC 1929 sub-negotiation and
//! the request; SOCKS4/4a authenticates by USERID only. CONNECT hands off
//! to the bidirectional relay, UDP ASSOCIATE to the datagram relay.

pub mod addr;
pub mod client;
pub mod udp;

use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::connect;
use crate::error::{Error, Result};
use crate::relay;
use crate::server::ServeContext;
use crate::socks::addr::SocksAddr;
use crate::stream::ProxyStream;

pub const SOCKS_VERSION_4: u8 = 0x04;
pub const SOCKS_VERSION_5: u8 = 0x05;

pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_USERPASS: u8 = 0x02;
pub const AUTH_UNACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub const SOCKS4_GRANTED: u8 = 90;
pub const SOCKS4_REJECTED: u8 = 91;
pub const SOCKS4_USER_NOT_ALLOWED: u8 = 93;

/// Map a connect error to the SOCKS5 reply code.
fn reply_code(err: &Error) -> u8 {
    match err {
        Error::ConnectRefused => REP_CONNECTION_REFUSED,
        Error::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

/// Serve a connection classified as SOCKS.
pub async fn serve(ctx: &ServeContext, mut stream: ProxyStream) -> Result<()> {
    if ctx.options.disable_socks {
        return Err(Error::PolicyDenied("socks disabled"));
    }

    match stream.read_u8().await? {
        SOCKS_VERSION_5 => serve_v5(ctx, stream).await,
        SOCKS_VERSION_4 => serve_v4(ctx, stream).await,
        other => Err(Error::protocol(format!("socks version {other:#04x}"))),
    }
}

async fn serve_v5(ctx: &ServeContext, mut stream: ProxyStream) -> Result<()> {
    let id = ctx.session.id();

    //  +----+----------+----------+
    //  |VER | NMETHODS | METHODS  |
    //  +----+----------+----------+
    let nmethods = stream.read_u8().await? as usize;
    if nmethods == 0 {
        return Err(Error::protocol("no auth methods offered"));
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let auth_required = ctx.options.auth_required();
    let method = methods
        .iter()
        .copied()
        .find(|&m| {
            if auth_required {
                m == AUTH_USERPASS
            } else {
                m == AUTH_NONE || m == AUTH_USERPASS
            }
        })
        .unwrap_or(AUTH_UNACCEPTABLE);

    stream.write_all(&[SOCKS_VERSION_5, method]).await?;
    if method == AUTH_UNACCEPTABLE {
        tracing::debug!("connection id: {id}, no acceptable socks5 method");
        return Err(Error::Auth);
    }

    if method == AUTH_USERPASS && !sub_negotiate(ctx, &mut stream).await? {
        return Err(Error::Auth);
    }

    //  +----+-----+-------+------+----------+----------+
    //  |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    //  +----+-----+-------+------+----------+----------+
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION_5 {
        return Err(Error::protocol("bad request version"));
    }
    let command = head[1];
    let target = SocksAddr::read_body(&mut stream, head[3]).await?;

    tracing::debug!(
        "connection id: {id}, {} request to {target}",
        match command {
            CMD_CONNECT => "connect",
            CMD_UDP_ASSOCIATE => "udp associate",
            _ => "unsupported",
        }
    );

    match command {
        CMD_CONNECT => {
            let established = connect::establish(
                id,
                &target.host(),
                target.port(),
                target.is_domain(),
                &ctx.options,
                &ctx.tls_client,
            )
            .await;

            match established {
                Ok(outbound) => {
                    let bnd = outbound
                        .endpoint
                        .map(SocksAddr::Ip)
                        .unwrap_or_else(|| target.clone());
                    reply_v5(&mut stream, REP_SUCCEEDED, &bnd).await?;

                    tracing::debug!("connection id: {id}, connected, start transfer");
                    let (up, down) =
                        relay::run(ctx.session.clone(), stream, outbound.stream).await;
                    ctx.session.add_transfer(up, down);
                    tracing::debug!("connection id: {id}, transfer completed");
                    Ok(())
                }
                Err(err) => {
                    reply_v5(&mut stream, reply_code(&err), &target).await?;
                    Err(err)
                }
            }
        }
        CMD_UDP_ASSOCIATE => udp::run_associate(ctx, stream, target).await,
        _ => {
            let zeros = SocksAddr::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
            reply_v5(&mut stream, REP_COMMAND_NOT_SUPPORTED, &zeros).await?;
            Err(Error::protocol(format!("unsupported command {command}")))
        }
    }
}

async fn sub_negotiate(ctx: &ServeContext, stream: &mut ProxyStream) -> Result<bool> {
    let id = ctx.session.id();

    //  +----+------+----------+------+----------+
    //  |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    //  +----+------+----------+------+----------+
    let version = stream.read_u8().await?;
    if version != 0x01 {
        return Err(Error::protocol("bad auth sub-negotiation version"));
    }

    let ulen = stream.read_u8().await? as usize;
    if ulen == 0 {
        return Err(Error::protocol("empty username"));
    }
    let mut username = vec![0u8; ulen];
    stream.read_exact(&mut username).await?;

    let plen = stream.read_u8().await? as usize;
    if plen == 0 {
        return Err(Error::protocol("empty password"));
    }
    let mut password = vec![0u8; plen];
    stream.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username);
    let password = String::from_utf8_lossy(&password);
    let passed = ctx.options.check_credentials(&username, &password);

    tracing::debug!(
        "connection id: {id}, auth: {username}, {}",
        if passed { "passed" } else { "rejected" }
    );

    stream
        .write_all(&[0x01, if passed { 0x00 } else { 0x01 }])
        .await?;
    Ok(passed)
}

async fn reply_v5(stream: &mut ProxyStream, code: u8, bnd: &SocksAddr) -> Result<()> {
    let mut buf = vec![SOCKS_VERSION_5, code, 0x00];
    bnd.encode_into(&mut buf);
    stream.write_all(&buf).await?;
    Ok(())
}

async fn read_cstring(stream: &mut ProxyStream) -> Result<String> {
    let mut out = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        if out.len() >= 255 {
            return Err(Error::protocol("socks4 string too long"));
        }
        out.push(byte);
    }
    String::from_utf8(out).map_err(|_| Error::protocol("socks4 string is not UTF-8"))
}

async fn serve_v4(ctx: &ServeContext, mut stream: ProxyStream) -> Result<()> {
    let id = ctx.session.id();

    //  +----+----+----+----+----+----+----+----+----+----+....+----+
    //  | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
    //  +----+----+----+----+----+----+----+----+----+----+....+----+
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;

    // DSTIP of the form 0.0.0.x (x != 0) flags a trailing hostname.
    let ip_value = u32::from_be_bytes(ip);
    let socks4a = ip_value != 0 && ip_value <= 0xff;

    let userid = read_cstring(&mut stream).await?;
    let hostname = if socks4a {
        Some(read_cstring(&mut stream).await?)
    } else {
        None
    };

    let dst = Ipv4Addr::from(ip);
    tracing::debug!(
        "connection id: {id}, socks4{} request to {}:{port}",
        if socks4a { "a" } else { "" },
        hostname.as_deref().unwrap_or(&dst.to_string())
    );

    if !ctx.options.check_username(&userid) {
        reply_v4(&mut stream, SOCKS4_USER_NOT_ALLOWED, port, ip).await?;
        tracing::debug!("connection id: {id}, socks4 user `{userid}` rejected");
        return Err(Error::Auth);
    }

    if command != CMD_CONNECT {
        reply_v4(&mut stream, SOCKS4_REJECTED, port, ip).await?;
        return Err(Error::protocol(format!(
            "unsupported socks4 command {command}"
        )));
    }

    let host = hostname.clone().unwrap_or_else(|| dst.to_string());
    let established = connect::establish(
        id,
        &host,
        port,
        socks4a,
        &ctx.options,
        &ctx.tls_client,
    )
    .await;

    match established {
        Ok(outbound) => {
            reply_v4(&mut stream, SOCKS4_GRANTED, port, ip).await?;

            tracing::debug!("connection id: {id}, connected, start transfer");
            let (up, down) = relay::run(ctx.session.clone(), stream, outbound.stream).await;
            ctx.session.add_transfer(up, down);
            tracing::debug!("connection id: {id}, transfer completed");
            Ok(())
        }
        Err(err) => {
            reply_v4(&mut stream, SOCKS4_REJECTED, port, ip).await?;
            Err(err)
        }
    }
}

async fn reply_v4(stream: &mut ProxyStream, code: u8, port: u16, ip: [u8; 4]) -> Result<()> {
    //  +----+----+----+----+----+----+----+----+
    //  | VN | CD | DSTPORT |      DSTIP        |
    //  +----+----+----+----+----+----+----+----+
    let mut buf = Vec::with_capacity(8);
    buf.push(0x00);
    buf.push(code);
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&ip);
    stream.write_all(&buf).await?;
    Ok(())
}
