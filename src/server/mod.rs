//! Proxy server: listener, accept loop and protocol dispatch.
//!
//! Each accepted connection is classified by peeking its first bytes
//! without consuming them:
//!
//! ```text
//!   0x05            socks5
//!   0x04            socks4/4a
//!   0x16            TLS; terminate and classify the plaintext
//!   'G' 'P' 'C'     http (forward proxy, CONNECT, or static site)
//!   anything else   scramble unwrap when enabled, otherwise close
//! ```
//!
//! Unknown traffic is dropped without emitting a byte.

pub mod config;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::scramble::{self, key_schedule};
use crate::stream::{ProxyStream, ScrambledStream};
use crate::{http, socks, tls};

use config::ServerOptions;
use session::{Registry, Session};

/// Concurrent accept tasks sharing the listener.
const ACCEPT_TASKS: usize = 32;

/// Everything a protocol handler needs besides its stream.
pub struct ServeContext {
    pub session: Arc<Session>,
    pub options: Arc<ServerOptions>,
    pub tls_client: Arc<rustls::ClientConfig>,
}

/// The proxy server.
pub struct Server {
    options: Arc<ServerOptions>,
    registry: Arc<Registry>,
    listener: TcpListener,
    tls_acceptor: Option<TlsAcceptor>,
    tls_client: Arc<rustls::ClientConfig>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Server {
    /// Validate options, build TLS contexts and bind the listener.
    pub async fn bind(options: ServerOptions) -> Result<Arc<Self>> {
        options.validate()?;

        let tls_acceptor = tls::server_config(&options.tls)?.map(TlsAcceptor::from);
        let tls_client = tls::client_config(&options.tls)?;

        let socket = if options.listen.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        if options.reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(options.listen)?;
        let listener = socket.listen(1024)?;

        if options.proxy_protocol {
            tracing::info!("proxy_protocol is reserved and not emitted");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Arc::new(Self {
            options: Arc::new(options),
            registry: Registry::new(),
            listener,
            tls_acceptor,
            tls_client,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of live sessions.
    pub fn num_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Serve until [`Server::close`] is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!("proxy listening on {}", self.local_addr()?);

        for _ in 0..ACCEPT_TASKS {
            let server = Arc::clone(&self);
            tokio::spawn(accept_loop(server));
        }

        let mut shutdown = self.shutdown_rx.clone();
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(())
    }

    /// Stop accepting and close every live session.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.registry.close_all();
    }

    fn is_aborted(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

async fn accept_loop(server: Arc<Server>) {
    let mut shutdown = server.shutdown_rx.clone();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            accepted = server.listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let server = Arc::clone(&server);
                tokio::spawn(handle_connection(server, stream, peer));
            }
            Err(e) => {
                if server.is_aborted() {
                    return;
                }
                tracing::warn!("accept error: {e}");
            }
        }
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let _ = SockRef::from(&stream).set_keepalive(true);
    // Nagle is deliberately kept on for scrambled listeners so packet sizes
    // stop mirroring individual writes.
    let _ = stream.set_nodelay(!server.options.scramble);

    let session = server.registry.create(peer);
    let id = session.id();
    tracing::debug!("connection id: {id}, client incoming: {peer}");

    let ctx = ServeContext {
        session: Arc::clone(&session),
        options: Arc::clone(&server.options),
        tls_client: Arc::clone(&server.tls_client),
    };

    let carrier = ScrambledStream::new(stream);
    let result = tokio::select! {
        _ = session.closed() => Err(Error::Aborted),
        result = detect(&server, &ctx, carrier, true) => result,
    };

    match result {
        Ok(()) => {}
        Err(err) if err.is_silent() => {
            tracing::debug!("connection id: {id}, closed: {err}");
        }
        Err(err) => {
            tracing::debug!("connection id: {id}, error: {err}");
        }
    }
}

/// Peek, classify, and hand the connection to its protocol handler.
async fn detect(
    server: &Server,
    ctx: &ServeContext,
    mut carrier: ScrambledStream,
    outermost: bool,
) -> Result<()> {
    let id = ctx.session.id();

    let mut head = [0u8; 5];
    let n = carrier.peek(&mut head).await?;
    if n == 0 {
        return Ok(());
    }
    let first = head[0];

    if ctx.options.disable_insecure && outermost && first != 0x16 {
        return Err(Error::PolicyDenied("insecure protocols disabled"));
    }

    match first {
        0x05 | 0x04 => {
            tracing::debug!("connection id: {id}, socks protocol");
            socks::serve(ctx, ProxyStream::plain(carrier)).await
        }
        0x16 => {
            let Some(acceptor) = &server.tls_acceptor else {
                return Err(Error::tls("no server certificate configured"));
            };
            let accepted = acceptor
                .accept(carrier)
                .await
                .map_err(|e| Error::tls(format!("accept: {e}")))?;
            tracing::debug!("connection id: {id}, TLS terminated");
            route_plaintext(ctx, ProxyStream::server_tls(accepted)).await
        }
        0x47 | 0x50 | 0x43 => {
            tracing::debug!("connection id: {id}, http protocol");
            http::serve(ctx, ProxyStream::plain(carrier)).await
        }
        _ if outermost && ctx.options.scramble => {
            tracing::debug!("connection id: {id}, scramble unwrap");
            let (sent, received) =
                scramble::exchange_noise(carrier.tcp(), ctx.options.noise_length).await?;
            carrier.set_scramble_keys(key_schedule(&sent), key_schedule(&received));

            // Classify again through the unscrambler; one unwrap only.
            Box::pin(detect(server, ctx, carrier, false)).await
        }
        other => Err(Error::protocol(format!("unknown first byte {other:#04x}"))),
    }
}

/// Classify a TLS-terminated stream by its first plaintext bytes.
async fn route_plaintext(ctx: &ServeContext, mut stream: ProxyStream) -> Result<()> {
    use tokio::io::AsyncReadExt;

    let mut first = [0u8; 2];
    stream.read_exact(&mut first).await?;
    stream.unread(&first);

    match first[0] {
        0x05 | 0x04 => socks::serve(ctx, stream).await,
        0x47 | 0x50 | 0x43 => http::serve(ctx, stream).await,
        other => Err(Error::protocol(format!(
            "unknown first byte {other:#04x} after TLS"
        ))),
    }
}
