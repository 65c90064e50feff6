//! HTTP CONNECT client handshake for http/https chained proxies.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const MAX_REPLY_HEAD: usize = 8 * 1024;

/// Issue `CONNECT host:port` to a chained proxy and require a 2xx reply.
pub async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    username: &str,
    password: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if !username.is_empty() {
        let token = BASE64.encode(format!("{username}:{password}"));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    // Read exactly up to the header terminator; the tunnel may start
    // flowing right after it and must not be swallowed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_REPLY_HEAD {
            return Err(Error::UpstreamHandshake("CONNECT reply too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::UpstreamHandshake(
                "chained proxy closed during CONNECT".into(),
            ));
        }
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Error::UpstreamHandshake("malformed CONNECT reply".into())),
    }

    match response.code {
        Some(code) if (200..300).contains(&code) => Ok(()),
        Some(code) => Err(Error::UpstreamHandshake(format!(
            "chained proxy replied {code}"
        ))),
        None => Err(Error::UpstreamHandshake("missing CONNECT status".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_connect_ok_and_no_overread() {
        let (mut client, mut server) = duplex(4096);

        let handshake = tokio::spawn(async move {
            handshake(&mut client, "example.com", 443, "alice", "s3cret").await?;
            // Bytes after the header belong to the tunnel.
            let mut tunnel = [0u8; 5];
            client.read_exact(&mut tunnel).await?;
            assert_eq!(&tunnel, b"early");
            Ok::<_, Error>(())
        });

        let mut request = vec![0u8; 1024];
        let n = server.read(&mut request).await.unwrap();
        let text = String::from_utf8_lossy(&request[..n]);
        assert!(text.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(text.contains("Proxy-Authorization: Basic YWxpY2U6czNjcmV0\r\n"));

        server
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nearly")
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejection() {
        let (mut client, mut server) = duplex(4096);

        let handshake =
            tokio::spawn(async move { handshake(&mut client, "example.com", 443, "", "").await });

        let mut sink = vec![0u8; 1024];
        let _ = server.read(&mut sink).await.unwrap();
        server
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();

        assert!(matches!(
            handshake.await.unwrap(),
            Err(Error::UpstreamHandshake(_))
        ));
    }
}
