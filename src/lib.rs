//! # veilproxy
//!
//! A multi-protocol forward proxy. One listening endpoint serves SOCKS4/4a,
//! SOCKS5 (CONNECT and UDP ASSOCIATE), HTTP CONNECT tunneling and HTTP
//! forward proxying, with optional inbound TLS termination, chaining
//! through an upstream proxy, scramble traffic obfuscation, and a
//! static-file web surface for unauthenticated HTTP requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                          │
//! │   accept → peek first bytes → classify → unwrap (TLS /     │
//! │   scramble) → protocol handler                              │
//! ├──────────────┬──────────────────────┬───────────────────────┤
//! │    SOCKS     │        HTTP          │     Static files      │
//! │  4/4a/5 +    │  CONNECT + absolute  │  range / autoindex /  │
//! │  UDP relay   │  URI keep-alive      │  MIME                 │
//! ├──────────────┴──────────────────────┴───────────────────────┤
//! │                     Upstream connector                      │
//! │   resolve → bind → Happy-Eyeballs → scramble → TLS →       │
//! │   socks/http chain handshake                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │              Bidirectional relay (half-close)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The scramble layer is obfuscation, not cryptography: a keyed XOR stream
//! whose key is agreed through a random-length noise exchange and rehashed
//! every sixteen bytes.

pub mod connect;
pub mod error;
pub mod http;
pub mod relay;
pub mod scramble;
pub mod server;
pub mod socks;
pub mod stream;
pub mod tls;

pub use error::{Error, Result};
pub use server::config::{OptionsFile, ServerOptions};
pub use server::Server;
