//! Bidirectional relay.
//!
//! Two concurrent one-way copies. A copy that sees EOF or a read error
//! flushes what it already read and shuts down the peer's write side so the
//! opposite endpoint observes EOF; a write error shuts down the source's
//! read side so the opposite copy on that socket unwinds instead of
//! blocking. Both copies finishing ends the session.

use std::net::Shutdown;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::server::session::Session;
use crate::stream::ProxyStream;

const RELAY_BUF_LEN: usize = 1024 * 1024;

/// Relay until both directions complete. Returns (client→remote,
/// remote→client) byte counts.
pub async fn run(
    session: Arc<Session>,
    client: ProxyStream,
    remote: ProxyStream,
) -> (u64, u64) {
    // Socket handles survive the split so a copy can shut down its source
    // when the sink fails.
    let client_socket = client.shutdown_handle().ok();
    let remote_socket = remote.shutdown_handle().ok();

    let (client_rd, client_wr) = tokio::io::split(client);
    let (remote_rd, remote_wr) = tokio::io::split(remote);

    tokio::join!(
        copy_direction(session.clone(), client_rd, remote_wr, client_socket),
        copy_direction(session, remote_rd, client_wr, remote_socket),
    )
}

async fn copy_direction(
    session: Arc<Session>,
    mut from: ReadHalf<ProxyStream>,
    mut to: WriteHalf<ProxyStream>,
    source: Option<socket2::Socket>,
) -> u64 {
    let mut buf = vec![0u8; RELAY_BUF_LEN];
    let mut total: u64 = 0;

    loop {
        if session.is_aborted() {
            let _ = to.shutdown().await;
            return total;
        }

        let n = tokio::select! {
            r = from.read(&mut buf) => match r {
                Ok(0) | Err(_) => {
                    let _ = to.shutdown().await;
                    return total;
                }
                Ok(n) => n,
            },
            _ = session.closed() => {
                let _ = to.shutdown().await;
                return total;
            }
        };

        if to.write_all(&buf[..n]).await.is_err() {
            // Stop reading the source so its pending I/O unwinds.
            if let Some(socket) = &source {
                let _ = socket.shutdown(Shutdown::Read);
            }
            return total;
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    use crate::server::session::Registry;
    use crate::stream::ScrambledStream;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn wrap(stream: TcpStream) -> ProxyStream {
        ProxyStream::plain(ScrambledStream::new(stream))
    }

    #[tokio::test]
    async fn test_relay_both_directions_and_half_close() {
        let registry = Registry::new();
        let session = registry.create("127.0.0.1:1".parse().unwrap());

        let (client_side, client_peer) = tcp_pair().await;
        let (remote_side, remote_peer) = tcp_pair().await;

        let relay = tokio::spawn(relay_task(session, client_peer, remote_side));

        let mut client = client_side;
        let mut remote = remote_peer;

        client.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        remote.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        remote.write_all(b"pong").await.unwrap();
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"pong");

        // Client close propagates as EOF to the remote and ends the relay.
        drop(client);
        let mut sink = Vec::new();
        remote.read_to_end(&mut sink).await.unwrap();
        drop(remote);

        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    async fn relay_task(
        session: Arc<Session>,
        client: TcpStream,
        remote: TcpStream,
    ) -> (u64, u64) {
        run(session, wrap(client), wrap(remote)).await
    }

    #[tokio::test]
    async fn test_write_error_unwinds_relay() {
        use std::time::Duration;

        let registry = Registry::new();
        let session = registry.create("127.0.0.1:1".parse().unwrap());

        let (client_side, client_peer) = tcp_pair().await;
        let (remote_side, remote_peer) = tcp_pair().await;

        let relay = tokio::spawn(relay_task(session, client_peer, remote_side));

        // Kill the remote end; writes towards it start failing once the
        // reset comes back.
        drop(remote_peer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = client_side;
        for _ in 0..10 {
            if client.write_all(b"payload").await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The failing copy shuts down its source's read side, so the relay
        // fully unwinds even though the client never closes.
        let finished = tokio::time::timeout(Duration::from_secs(2), relay).await;
        assert!(finished.is_ok());
    }

    #[tokio::test]
    async fn test_relay_aborts_on_session_close() {
        let registry = Registry::new();
        let session = registry.create("127.0.0.1:1".parse().unwrap());

        let (client_side, client_peer) = tcp_pair().await;
        let (remote_side, _remote_peer) = tcp_pair().await;

        let relay = tokio::spawn(relay_task(session.clone(), client_peer, remote_side));

        // Neither side sends anything; closing the session must end the
        // relay anyway.
        session.close();
        let (up, down) = relay.await.unwrap();
        assert_eq!(up + down, 0);

        drop(client_side);
    }
}
