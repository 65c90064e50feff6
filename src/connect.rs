//! Upstream connector.
//!
//! Produces the outbound stream for a session: either a direct connection
//! to the target or a tunnel through the configured chained proxy, with
//! optional local-address binding, Happy-Eyeballs connecting, scramble
//! keying and TLS.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::http;
use crate::scramble::{exchange_noise, key_schedule};
use crate::server::config::{ChainScheme, ServerOptions};
use crate::socks;
use crate::stream::{ProxyStream, ScrambledStream};

/// Stagger between parallel connect attempts.
const CONNECT_STAGGER: Duration = Duration::from_millis(250);

/// A ready outbound stream.
pub struct Established {
    pub stream: ProxyStream,
    /// Resolved destination endpoint, when the connection is direct.
    pub endpoint: Option<SocketAddr>,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Connect to `host:port` on behalf of a session.
///
/// `resolve_remotely` marks targets given by name: resolved locally on
/// direct connections, passed through to the chained proxy otherwise.
pub async fn establish(
    id: u64,
    host: &str,
    port: u16,
    resolve_remotely: bool,
    options: &ServerOptions,
    tls_client: &Arc<rustls::ClientConfig>,
) -> Result<Established> {
    match &options.next_proxy {
        Some(chain) => {
            let stream = establish_chained(id, host, port, chain, options, tls_client).await?;
            tracing::debug!(
                "connection id: {id}, chained via {}://{}:{} to {host}:{port}",
                match chain.scheme {
                    ChainScheme::Socks4 => "socks4",
                    ChainScheme::Socks4a => "socks4a",
                    ChainScheme::Socks5 => "socks5",
                    ChainScheme::Http => "http",
                    ChainScheme::Https => "https",
                },
                chain.host,
                chain.port
            );
            Ok(Established {
                stream,
                endpoint: None,
            })
        }
        None => {
            let addrs = if resolve_remotely {
                resolve(host, port).await?
            } else {
                let ip: IpAddr = host
                    .parse()
                    .map_err(|_| Error::resolve(format!("not an address literal: {host}")))?;
                vec![SocketAddr::new(ip, port)]
            };

            let stream = connect_candidates(addrs, options).await?;
            let endpoint = stream.peer_addr().ok();
            tracing::debug!("connection id: {id}, connected to {host}:{port}");

            Ok(Established {
                stream: ProxyStream::plain(ScrambledStream::new(stream)),
                endpoint,
            })
        }
    }
}

async fn establish_chained(
    id: u64,
    host: &str,
    port: u16,
    chain: &crate::server::config::NextProxy,
    options: &ServerOptions,
    tls_client: &Arc<rustls::ClientConfig>,
) -> Result<ProxyStream> {
    let addrs = resolve(&chain.host, chain.port).await?;
    let tcp = connect_candidates(addrs, options).await?;
    let mut carrier = ScrambledStream::new(tcp);

    // Scramble keys first: TLS, when used, runs over the scrambled stream.
    if options.scramble {
        let (sent, received) = exchange_noise(carrier.tcp(), options.noise_length).await?;
        carrier.set_scramble_keys(key_schedule(&sent), key_schedule(&received));
        tracing::debug!(
            "connection id: {id}, scramble keyed towards upstream ({} byte noise)",
            sent.len()
        );
    }

    let use_tls = (chain.scheme.is_socks() && options.next_proxy_use_tls)
        || chain.scheme == ChainScheme::Https;

    let mut stream = if use_tls {
        let sni = options
            .tls
            .sni
            .clone()
            .unwrap_or_else(|| chain.host.clone());
        let name = ServerName::try_from(sni.clone())
            .map_err(|_| Error::tls(format!("invalid SNI hostname: {sni}")))?;

        let connector = TlsConnector::from(Arc::clone(tls_client));
        let tls = connector
            .connect(name, carrier)
            .await
            .map_err(|e| Error::tls(format!("upstream handshake: {e}")))?;
        tracing::debug!("connection id: {id}, TLS established with {}", chain.host);
        ProxyStream::client_tls(tls)
    } else {
        ProxyStream::plain(carrier)
    };

    match chain.scheme {
        ChainScheme::Http | ChainScheme::Https => {
            http::client::handshake(&mut stream, host, port, &chain.username, &chain.password)
                .await?;
        }
        scheme => {
            socks::client::handshake(
                &mut stream,
                scheme,
                host,
                port,
                &chain.username,
                &chain.password,
            )
            .await?;
        }
    }

    Ok(stream)
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::resolve(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::resolve(format!("{host}: no addresses")));
    }
    Ok(addrs)
}

async fn connect_candidates(addrs: Vec<SocketAddr>, options: &ServerOptions) -> Result<TcpStream> {
    let bind = options.local_bind_address;
    let result = if options.happy_eyeballs {
        parallel_connect(interleave(addrs), bind).await
    } else {
        sequential_connect(addrs, bind).await
    };
    result.map_err(Error::from_connect_io)
}

fn connect_socket(addr: SocketAddr, bind: Option<IpAddr>) -> std::io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(ip) = bind {
        socket.bind(SocketAddr::new(ip, 0))?;
    }
    Ok(socket)
}

async fn connect_endpoint(addr: SocketAddr, bind: Option<IpAddr>) -> std::io::Result<TcpStream> {
    connect_socket(addr, bind)?.connect(addr).await
}

async fn sequential_connect(
    addrs: Vec<SocketAddr>,
    bind: Option<IpAddr>,
) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match connect_endpoint(addr, bind).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()))
}

/// Interleave address families, keeping resolver order within each family.
fn interleave(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());

    let mut out = Vec::with_capacity(v6.len() + v4.len());
    let mut v6 = v6.into_iter();
    let mut v4 = v4.into_iter();
    loop {
        match (v6.next(), v4.next()) {
            (None, None) => break,
            (a, b) => {
                out.extend(a);
                out.extend(b);
            }
        }
    }
    out
}

/// Happy-Eyeballs style race: attempts start `CONNECT_STAGGER` apart, the
/// first established stream wins and the rest are aborted.
async fn parallel_connect(
    addrs: Vec<SocketAddr>,
    bind: Option<IpAddr>,
) -> std::io::Result<TcpStream> {
    let total = addrs.len();
    let (tx, mut rx) = mpsc::channel(total.max(1));

    let mut attempts = Vec::with_capacity(total);
    for (i, addr) in addrs.into_iter().enumerate() {
        let tx = tx.clone();
        attempts.push(tokio::spawn(async move {
            if i > 0 {
                tokio::time::sleep(CONNECT_STAGGER * i as u32).await;
            }
            let _ = tx.send(connect_endpoint(addr, bind).await).await;
        }));
    }
    drop(tx);

    let mut last_err = None;
    while let Some(result) = rx.recv().await {
        match result {
            Ok(stream) => {
                for attempt in &attempts {
                    attempt.abort();
                }
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::ErrorKind::AddrNotAvailable.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_interleave_families() {
        let addrs: Vec<SocketAddr> = vec![
            "[2001:db8::1]:80".parse().unwrap(),
            "[2001:db8::2]:80".parse().unwrap(),
            "192.0.2.1:80".parse().unwrap(),
            "192.0.2.2:80".parse().unwrap(),
        ];
        let mixed = interleave(addrs);
        assert!(mixed[0].is_ipv6());
        assert!(mixed[1].is_ipv4());
        assert!(mixed[2].is_ipv6());
        assert!(mixed[3].is_ipv4());
    }

    #[tokio::test]
    async fn test_direct_establish() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = ServerOptions::default();
        let tls = crate::tls::client_config(&options.tls).unwrap();

        let accept = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        });

        let established = establish(1, &addr.ip().to_string(), addr.port(), false, &options, &tls)
            .await
            .unwrap();
        assert_eq!(established.endpoint, Some(addr));

        let mut stream = established.stream;
        stream.write_all(b"ping").await.unwrap();
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_refused_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ServerOptions::default();
        let tls = crate::tls::client_config(&options.tls).unwrap();
        let err = establish(1, "127.0.0.1", addr.port(), false, &options, &tls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectRefused));
    }

    #[tokio::test]
    async fn test_bad_literal_rejected() {
        let options = ServerOptions::default();
        let tls = crate::tls::client_config(&options.tls).unwrap();
        let err = establish(1, "not-an-ip", 80, false, &options, &tls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolve(_)));
    }

    #[tokio::test]
    async fn test_chained_socks5() {
        // A minimal socks5 upstream accepting one CONNECT.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let upstream = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            peer.read_exact(&mut greeting).await.unwrap();
            peer.write_all(&[5, 0]).await.unwrap();

            let mut head = [0u8; 5];
            peer.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[5, 1, 0, 3]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            peer.read_exact(&mut rest).await.unwrap();
            peer.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();

            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"relay");
        });

        let mut options = ServerOptions::default();
        options.next_proxy =
            Some(crate::server::config::NextProxy::parse(&format!("socks5://{addr}")).unwrap());
        let tls = crate::tls::client_config(&options.tls).unwrap();

        let established = establish(1, "target.test", 9000, true, &options, &tls)
            .await
            .unwrap();
        assert!(established.endpoint.is_none());

        let mut stream = established.stream;
        stream.write_all(b"relay").await.unwrap();
        upstream.await.unwrap();
    }
}
