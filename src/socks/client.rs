//! SOCKS client handshakes for chained upstream proxies.
//!
//! SOCKS5 requests the final target in hostname mode so the chained proxy
//! performs DNS; SOCKS4 resolves locally (the protocol only carries an
//! IPv4 address) and SOCKS4a passes the hostname through.

use std::net::{IpAddr, Ipv4Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::server::config::ChainScheme;
use crate::socks::addr::SocksAddr;
use crate::socks::{
    AUTH_NONE, AUTH_UNACCEPTABLE, AUTH_USERPASS, CMD_CONNECT, REP_SUCCEEDED, SOCKS4_GRANTED,
    SOCKS_VERSION_4, SOCKS_VERSION_5,
};

/// Run the client side of a SOCKS chain handshake, requesting a tunnel to
/// `host:port`.
pub async fn handshake<S>(
    stream: &mut S,
    scheme: ChainScheme,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match scheme {
        ChainScheme::Socks5 => handshake_v5(stream, host, port, username, password).await,
        ChainScheme::Socks4 => handshake_v4(stream, host, port, username, false).await,
        ChainScheme::Socks4a => handshake_v4(stream, host, port, username, true).await,
        _ => Err(Error::config("not a socks chain scheme")),
    }
}

async fn handshake_v5<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let have_creds = !username.is_empty();
    if have_creds {
        stream
            .write_all(&[SOCKS_VERSION_5, 2, AUTH_NONE, AUTH_USERPASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS_VERSION_5, 1, AUTH_NONE]).await?;
    }

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION_5 {
        return Err(Error::UpstreamHandshake(format!(
            "bad socks5 version {:#04x}",
            reply[0]
        )));
    }

    match reply[1] {
        AUTH_NONE => {}
        AUTH_USERPASS if have_creds => {
            // RFC 1929 sub-negotiation.
            let mut msg = Vec::with_capacity(3 + username.len() + password.len());
            msg.push(0x01);
            msg.push(username.len() as u8);
            msg.extend_from_slice(username.as_bytes());
            msg.push(password.len() as u8);
            msg.extend_from_slice(password.as_bytes());
            stream.write_all(&msg).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(Error::UpstreamHandshake(
                    "chained proxy rejected credentials".into(),
                ));
            }
        }
        AUTH_UNACCEPTABLE => {
            return Err(Error::UpstreamHandshake(
                "chained proxy accepts none of our auth methods".into(),
            ))
        }
        other => {
            return Err(Error::UpstreamHandshake(format!(
                "chained proxy selected unsupported method {other:#04x}"
            )))
        }
    }

    // Request. IP literals go as their native ATYP, names in hostname mode.
    let target = match host.parse::<IpAddr>() {
        Ok(ip) => SocksAddr::Ip((ip, port).into()),
        Err(_) => SocksAddr::Domain(host.to_string(), port),
    };

    let mut request = vec![SOCKS_VERSION_5, CMD_CONNECT, 0x00];
    target.encode_into(&mut request);
    stream.write_all(&request).await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION_5 {
        return Err(Error::UpstreamHandshake("bad reply version".into()));
    }
    if head[1] != REP_SUCCEEDED {
        return Err(Error::UpstreamHandshake(format!(
            "chained proxy replied {:#04x}",
            head[1]
        )));
    }

    // Consume BND.ADDR/BND.PORT.
    SocksAddr::read_from(stream).await?;
    Ok(())
}

async fn handshake_v4<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    userid: &str,
    socks4a: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS_VERSION_4, CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());

    let hostname = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.extend_from_slice(&v4.octets());
            None
        }
        Ok(IpAddr::V6(_)) => {
            return Err(Error::UpstreamHandshake(
                "socks4 chain cannot carry an IPv6 target".into(),
            ))
        }
        Err(_) if socks4a => {
            // DSTIP 0.0.0.1 flags a trailing hostname.
            request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
            Some(host)
        }
        Err(_) => {
            // Plain socks4 carries no hostname; resolve here.
            let resolved = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| Error::resolve(e.to_string()))?
                .find_map(|addr| match addr.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .ok_or_else(|| Error::resolve(format!("no IPv4 address for {host}")))?;
            request.extend_from_slice(&resolved.octets());
            None
        }
    };

    request.extend_from_slice(userid.as_bytes());
    request.push(0);
    if let Some(name) = hostname {
        request.extend_from_slice(name.as_bytes());
        request.push(0);
    }

    stream.write_all(&request).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(Error::UpstreamHandshake(format!(
            "socks4 chain replied {}",
            reply[1]
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_v5_no_auth() {
        let (mut client, mut server) = duplex(4096);

        let handshake = tokio::spawn(async move {
            handshake_v5(&mut client, "example.com", 443, "", "").await
        });

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        server.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 4];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [5, 1, 0, 3]);
        let mut len = [0u8; 1];
        server.read_exact(&mut len).await.unwrap();
        let mut rest = vec![0u8; len[0] as usize + 2];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest[..len[0] as usize], b"example.com");
        assert_eq!(&rest[len[0] as usize..], &443u16.to_be_bytes());

        server
            .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_v5_password() {
        let (mut client, mut server) = duplex(4096);

        let handshake = tokio::spawn(async move {
            handshake_v5(&mut client, "10.0.0.1", 80, "alice", "s3cret").await
        });

        let mut greeting = [0u8; 4];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 2, 0, 2]);
        server.write_all(&[5, 2]).await.unwrap();

        let mut sub = [0u8; 3 + 5 + 6];
        server.read_exact(&mut sub).await.unwrap();
        assert_eq!(&sub[..2], &[1, 5]);
        assert_eq!(&sub[2..7], b"alice");
        assert_eq!(sub[7], 6);
        assert_eq!(&sub[8..], b"s3cret");
        server.write_all(&[1, 0]).await.unwrap();

        let mut request = [0u8; 10];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[5, 1, 0, 1]);
        assert_eq!(&request[4..8], &[10, 0, 0, 1]);
        server
            .write_all(&[5, 0, 0, 1, 10, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_v5_rejection_surfaces() {
        let (mut client, mut server) = duplex(4096);

        let handshake =
            tokio::spawn(
                async move { handshake_v5(&mut client, "example.com", 443, "", "").await },
            );

        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        server.write_all(&[5, 0xff]).await.unwrap();

        assert!(matches!(
            handshake.await.unwrap(),
            Err(Error::UpstreamHandshake(_))
        ));
    }

    #[tokio::test]
    async fn test_v4a_hostname() {
        let (mut client, mut server) = duplex(4096);

        let handshake = tokio::spawn(async move {
            handshake_v4(&mut client, "example.com", 443, "userid", true).await
        });

        let mut head = [0u8; 8];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(&head[..2], &[4, 1]);
        assert_eq!(&head[2..4], &443u16.to_be_bytes());
        assert_eq!(&head[4..8], &[0, 0, 0, 1]);

        let mut tail = vec![0u8; "userid".len() + 1 + "example.com".len() + 1];
        server.read_exact(&mut tail).await.unwrap();
        assert_eq!(&tail[..7], b"userid\0");
        assert_eq!(&tail[7..], b"example.com\0");

        server.write_all(&[0, 90, 1, 187, 0, 0, 0, 42]).await.unwrap();
        handshake.await.unwrap().unwrap();
    }
}
