//! Composable connection streams.
//!
//! Every connection is carried by a [`ScrambledStream`]: a TCP socket with a
//! per-direction scramble transform that stays inactive until keyed, so the
//! same type serves plain and obfuscated traffic. [`ProxyStream`] layers the
//! optional TLS stage on top and is the type protocol handlers talk to.
//!
//! Composition order is fixed: scramble sits directly above TCP, TLS (when
//! present) above scramble.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::scramble::ScrambleState;

/// TCP stream with an optional scramble transform per direction.
pub struct ScrambledStream {
    inner: TcpStream,
    tx: ScrambleState,
    rx: ScrambleState,
    // In-flight scrambled write: transformed bytes must hit the wire exactly
    // once, so a partially accepted write is parked here until drained.
    write_buf: Vec<u8>,
    write_pos: usize,
    write_claim: usize,
}

impl ScrambledStream {
    /// Wrap a TCP stream; both directions start as identity transforms.
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            tx: ScrambleState::default(),
            rx: ScrambleState::default(),
            write_buf: Vec::new(),
            write_pos: 0,
            write_claim: 0,
        }
    }

    /// Activate scrambling with the given transmit and receive keys.
    pub fn set_scramble_keys(&mut self, tx_key: [u8; 16], rx_key: [u8; 16]) {
        self.tx.set_key(tx_key);
        self.rx.set_key(rx_key);
    }

    /// Whether the receive direction unscrambles.
    pub fn is_scrambled(&self) -> bool {
        self.rx.is_valid()
    }

    /// Peek without consuming, descrambling through a snapshot of the
    /// receive state so the codec position does not advance.
    pub async fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.peek(buf).await?;
        if self.rx.is_valid() {
            let mut snapshot = self.rx.clone();
            snapshot.apply(&mut buf[..n]);
        }
        Ok(n)
    }

    /// Remote endpoint of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Access the raw TCP stream (noise exchange runs before keying).
    pub fn tcp(&mut self) -> &mut TcpStream {
        &mut self.inner
    }

    /// Clone a socket handle that can shut down directions while the
    /// stream itself is split across relay tasks.
    pub fn shutdown_handle(&self) -> io::Result<socket2::Socket> {
        SockRef::from(&self.inner).try_clone()
    }

    fn poll_drain_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ScrambledStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;

        let me = self.get_mut();
        if me.rx.is_valid() {
            let filled = buf.filled_mut();
            me.rx.apply(&mut filled[before..]);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScrambledStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if !me.tx.is_valid() {
            return Pin::new(&mut me.inner).poll_write(cx, buf);
        }

        if me.write_buf.is_empty() {
            me.write_buf.extend_from_slice(buf);
            me.tx.apply(&mut me.write_buf);
            me.write_claim = buf.len();
        }

        ready!(me.poll_drain_write(cx))?;
        Poll::Ready(Ok(me.write_claim))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_drain_write(cx))?;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_drain_write(cx))?;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}

enum StreamKind {
    Plain(ScrambledStream),
    Tls(Box<tokio_rustls::TlsStream<ScrambledStream>>),
}

/// The stream protocol handlers read and write.
///
/// Either the carrier directly or a TLS session running over it. A small
/// rewind buffer lets the dispatcher hand back bytes it consumed while
/// classifying, so handlers always see the stream from its first byte.
pub struct ProxyStream {
    kind: StreamKind,
    rewind: Vec<u8>,
}

impl ProxyStream {
    pub fn plain(stream: ScrambledStream) -> Self {
        Self {
            kind: StreamKind::Plain(stream),
            rewind: Vec::new(),
        }
    }

    pub fn server_tls(stream: tokio_rustls::server::TlsStream<ScrambledStream>) -> Self {
        Self {
            kind: StreamKind::Tls(Box::new(tokio_rustls::TlsStream::Server(stream))),
            rewind: Vec::new(),
        }
    }

    pub fn client_tls(stream: tokio_rustls::client::TlsStream<ScrambledStream>) -> Self {
        Self {
            kind: StreamKind::Tls(Box::new(tokio_rustls::TlsStream::Client(stream))),
            rewind: Vec::new(),
        }
    }

    /// Whether the inbound side is TLS-terminated.
    pub fn is_tls(&self) -> bool {
        matches!(self.kind, StreamKind::Tls(_))
    }

    /// Remote endpoint of the underlying socket.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match &self.kind {
            StreamKind::Plain(s) => s.peer_addr(),
            StreamKind::Tls(s) => match s.as_ref() {
                tokio_rustls::TlsStream::Client(c) => c.get_ref().0.peer_addr(),
                tokio_rustls::TlsStream::Server(s) => s.get_ref().0.peer_addr(),
            },
        }
    }

    /// Clone a socket handle for shutting down the underlying socket out
    /// of band.
    pub fn shutdown_handle(&self) -> io::Result<socket2::Socket> {
        match &self.kind {
            StreamKind::Plain(s) => s.shutdown_handle(),
            StreamKind::Tls(s) => match s.as_ref() {
                tokio_rustls::TlsStream::Client(c) => c.get_ref().0.shutdown_handle(),
                tokio_rustls::TlsStream::Server(s) => s.get_ref().0.shutdown_handle(),
            },
        }
    }

    /// Push bytes back to the front of the read stream.
    pub fn unread(&mut self, data: &[u8]) {
        let mut buf = Vec::with_capacity(data.len() + self.rewind.len());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&self.rewind);
        self.rewind = buf;
    }
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.rewind.is_empty() {
            let n = me.rewind.len().min(buf.remaining());
            buf.put_slice(&me.rewind[..n]);
            me.rewind.drain(..n);
            return Poll::Ready(Ok(()));
        }

        match &mut me.kind {
            StreamKind::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().kind {
            StreamKind::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().kind {
            StreamKind::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().kind {
            StreamKind::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamKind::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::scramble::key_schedule;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (client, accepted) = tokio::join!(client, listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_passthrough_without_keys() {
        let (a, b) = tcp_pair().await;
        let mut a = ScrambledStream::new(a);
        let mut b = ScrambledStream::new(b);

        a.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn test_scrambled_roundtrip_and_wire_divergence() {
        let (a, b) = tcp_pair().await;
        let key_ab = key_schedule(b"a to b");
        let key_ba = key_schedule(b"b to a");

        let mut a = ScrambledStream::new(a);
        a.set_scramble_keys(key_ab, key_ba);

        // Keep b raw to observe wire bytes.
        let mut raw_b = b;

        let plain: Vec<u8> = (0..32u8).collect();
        a.write_all(&plain).await.unwrap();

        let mut wire = vec![0u8; 32];
        raw_b.read_exact(&mut wire).await.unwrap();
        assert_ne!(wire, plain);

        // Descramble on the raw side with the matching key.
        let mut dec = ScrambleState::default();
        dec.set_key(key_ab);
        dec.apply(&mut wire);
        assert_eq!(wire, plain);
    }

    #[tokio::test]
    async fn test_scrambled_peek_does_not_consume() {
        let (a, b) = tcp_pair().await;
        let key = key_schedule(b"dir");

        let mut a = ScrambledStream::new(a);
        a.set_scramble_keys(key, key);
        let mut b = ScrambledStream::new(b);
        b.set_scramble_keys(key, key);

        a.write_all(b"\x05\x01\x00").await.unwrap();

        // Peek until all three bytes arrived (peek returns what is buffered).
        let mut peeked = [0u8; 5];
        let mut n = 0;
        while n < 3 {
            n = b.peek(&mut peeked).await.unwrap();
        }
        assert_eq!(&peeked[..n], b"\x05\x01\x00");

        // A second peek and the real read still see the same plaintext.
        let n = b.peek(&mut peeked).await.unwrap();
        assert_eq!(&peeked[..n], b"\x05\x01\x00");

        let mut got = [0u8; 3];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"\x05\x01\x00");
    }

    #[tokio::test]
    async fn test_shutdown_handle_breaks_reads() {
        let (a, b) = tcp_pair().await;
        let a = ProxyStream::plain(ScrambledStream::new(a));

        let handle = a.shutdown_handle().unwrap();
        let (mut read_half, _write_half) = tokio::io::split(a);

        // Shutting the read side down makes a pending or future read
        // observe EOF even though the peer stays open.
        handle.shutdown(std::net::Shutdown::Read).unwrap();

        let mut buf = [0u8; 8];
        let n = read_half.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        drop(b);
    }

    #[tokio::test]
    async fn test_proxy_stream_unread() {
        let (a, b) = tcp_pair().await;
        let mut a = ProxyStream::plain(ScrambledStream::new(a));
        let mut b = ProxyStream::plain(ScrambledStream::new(b));

        a.write_all(b"CONNECT target").await.unwrap();

        let mut first = [0u8; 2];
        b.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"CO");

        // Handing the classified bytes back restores the full stream.
        b.unread(&first);
        let mut got = [0u8; 14];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"CONNECT target");
    }
}
