//! Error types for the proxy.

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving or chaining a connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed greeting, header, or unsupported protocol field
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Credentials missing, malformed, or wrong
    #[error("authentication failed")]
    Auth,

    /// Protocol disabled by configuration
    #[error("denied by policy: {0}")]
    PolicyDenied(&'static str),

    /// Name resolution produced no usable address
    #[error("resolve failed: {0}")]
    Resolve(String),

    /// Target or next hop refused the connection
    #[error("connection refused")]
    ConnectRefused,

    /// No route to the target network
    #[error("network unreachable")]
    NetworkUnreachable,

    /// Connect attempt timed out
    #[error("connect timed out")]
    ConnectTimeout,

    /// Connect failed for a reason with no dedicated SOCKS reply
    #[error("connect failed: {0}")]
    Connect(String),

    /// The chained proxy rejected our client handshake
    #[error("upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    /// TLS accept or client handshake failed
    #[error("TLS error: {0}")]
    Tls(String),

    /// Scramble noise exchange failed
    #[error("scramble handshake failed: {0}")]
    Scramble(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Server is shutting down
    #[error("aborted")]
    Aborted,
}

impl Error {
    /// Create a new protocol violation error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new resolve error.
    pub fn resolve(msg: impl Into<String>) -> Self {
        Error::Resolve(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Create a new scramble error.
    pub fn scramble(msg: impl Into<String>) -> Self {
        Error::Scramble(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Classify a connect-phase I/O error into the distinct kinds the
    /// protocol handlers map to reply codes.
    pub fn from_connect_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::ConnectionRefused => Error::ConnectRefused,
            ErrorKind::TimedOut => Error::ConnectTimeout,
            // ENETUNREACH/EHOSTUNREACH surface as raw codes on some kernels.
            _ => match err.raw_os_error() {
                Some(101) | Some(113) => Error::NetworkUnreachable,
                _ => Error::Connect(err.to_string()),
            },
        }
    }

    /// Check whether this error indicates authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Auth)
    }

    /// Check whether the connection should be closed without any reply
    /// bytes (no banner that would aid fingerprinting).
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Error::PolicyDenied(_) | Error::Tls(_) | Error::Scramble(_) | Error::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_display() {
        let err = Error::Auth;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::ConnectRefused;
        assert_eq!(err.to_string(), "connection refused");
    }

    #[test]
    fn test_connect_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            Error::from_connect_io(refused),
            Error::ConnectRefused
        ));

        let unreach = io::Error::from_raw_os_error(101);
        assert!(matches!(
            Error::from_connect_io(unreach),
            Error::NetworkUnreachable
        ));

        let other = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(matches!(Error::from_connect_io(other), Error::Connect(_)));
    }

    #[test]
    fn test_silent_close() {
        assert!(Error::PolicyDenied("socks disabled").is_silent());
        assert!(Error::Aborted.is_silent());
        assert!(!Error::ConnectRefused.is_silent());
    }
}
