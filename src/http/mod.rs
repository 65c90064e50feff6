//! HTTP proxying: CONNECT tunneling and absolute-URI forwarding.
//!
//! Requests are parsed with `httparse` into owned messages so they can be
//! rewritten before forwarding. Error responses imitate an nginx origin so
//! the proxy surface is indistinguishable from a web server.

pub mod client;
pub mod files;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::connect;
use crate::error::{Error, Result};
use crate::relay;
use crate::server::ServeContext;
use crate::stream::ProxyStream;

/// Server identity presented on every generated response.
pub const SERVER_NAME: &str = "nginx/1.20.2";

const MAX_HEADER_LEN: usize = 64 * 1024;
/// Inbound request body limit.
const MAX_REQUEST_BODY: usize = 512 * 1024;
/// Buffered upstream response body limit.
const MAX_RESPONSE_BODY: usize = 8 * 1024 * 1024;

/// RFC 7231 formatted current date.
pub fn http_date() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// A parsed, owned HTTP request.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// A parsed, owned HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub minor: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Body ran to connection close; the forwarder must close too.
    pub eof_delimited: bool,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn keep_alive_for(minor: u8, connection: Option<&str>) -> bool {
    match connection {
        Some(value) => {
            let value = value.to_ascii_lowercase();
            if value.contains("close") {
                false
            } else if value.contains("keep-alive") {
                true
            } else {
                minor >= 1
            }
        }
        None => minor >= 1,
    }
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn keep_alive(&self) -> bool {
        keep_alive_for(self.minor, self.header("connection"))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.minor).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn keep_alive(&self) -> bool {
        !self.eof_delimited && keep_alive_for(self.minor, self.header("connection"))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", self.minor, self.status, self.reason).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Incremental reader holding bytes past the current message for the next
/// keep-alive round.
pub struct MessageReader {
    buf: Vec<u8>,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes read past the last parsed message.
    pub fn into_leftover(self) -> Vec<u8> {
        self.buf
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_head<S>(&mut self, stream: &mut S) -> Result<Option<usize>>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            if let Some(pos) = self
                .buf
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
            {
                return Ok(Some(pos + 4));
            }
            if self.buf.len() > MAX_HEADER_LEN {
                return Err(Error::protocol("header section too large"));
            }
            if self.fill(stream).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(Error::protocol("truncated header section"));
            }
        }
    }

    async fn read_exact_body<S>(&mut self, stream: &mut S, len: usize) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        while self.buf.len() < len {
            if self.fill(stream).await? == 0 {
                return Err(Error::protocol("truncated body"));
            }
        }
        let rest = self.buf.split_off(len);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    /// De-chunk a chunked body. Trailers are consumed and discarded.
    async fn read_chunked_body<S>(&mut self, stream: &mut S, limit: usize) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let mut body = Vec::new();
        loop {
            // Chunk-size line.
            let line_end = loop {
                if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                    break pos;
                }
                if self.fill(stream).await? == 0 {
                    return Err(Error::protocol("truncated chunked body"));
                }
            };
            let size_text = String::from_utf8_lossy(&self.buf[..line_end]).into_owned();
            self.buf.drain(..line_end + 2);

            let size_text = size_text.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| Error::protocol("bad chunk size"))?;

            if size == 0 {
                // Consume trailers up to the final blank line.
                loop {
                    if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                        let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                        if line == b"\r\n" {
                            return Ok(body);
                        }
                    } else if self.fill(stream).await? == 0 {
                        return Err(Error::protocol("truncated chunk trailers"));
                    }
                }
            }

            if body.len() + size > limit {
                return Err(Error::protocol("chunked body too large"));
            }
            let chunk = self.read_exact_body(stream, size + 2).await?;
            if &chunk[size..] != b"\r\n" {
                return Err(Error::protocol("bad chunk terminator"));
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    /// Read one request. `None` means the connection closed cleanly at a
    /// message boundary.
    pub async fn read_request<S>(&mut self, stream: &mut S) -> Result<Option<Request>>
    where
        S: AsyncRead + Unpin,
    {
        let Some(head_len) = self.read_head(stream).await? else {
            return Ok(None);
        };

        let mut raw_headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut raw_headers);
        let head: Vec<u8> = self.buf.drain(..head_len).collect();
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            _ => return Err(Error::protocol("malformed request head")),
        }

        let mut request = Request {
            method: parsed.method.unwrap_or_default().to_string(),
            target: parsed.path.unwrap_or_default().to_string(),
            minor: parsed.version.unwrap_or(1) as u8,
            headers: parsed
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            body: Vec::new(),
        };

        if let Some(te) = request.header("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                request.body = self.read_chunked_body(stream, MAX_REQUEST_BODY).await?;
                request.remove_header("transfer-encoding");
                request.set_header("Content-Length", request.body.len().to_string());
                return Ok(Some(request));
            }
        }

        if let Some(length) = request.header("content-length") {
            let length: usize = length
                .trim()
                .parse()
                .map_err(|_| Error::protocol("bad content-length"))?;
            if length > MAX_REQUEST_BODY {
                return Err(Error::protocol("request body too large"));
            }
            request.body = self.read_exact_body(stream, length).await?;
        }

        Ok(Some(request))
    }

    /// Read one response. `head_request` suppresses the body.
    pub async fn read_response<S>(&mut self, stream: &mut S, head_request: bool) -> Result<Response>
    where
        S: AsyncRead + Unpin,
    {
        loop {
            let head_len = self
                .read_head(stream)
                .await?
                .ok_or_else(|| Error::protocol("upstream closed before response"))?;

            let mut raw_headers = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut raw_headers);
            let head: Vec<u8> = self.buf.drain(..head_len).collect();
            match parsed.parse(&head) {
                Ok(httparse::Status::Complete(_)) => {}
                _ => return Err(Error::protocol("malformed response head")),
            }

            let status = parsed.code.unwrap_or(502);
            let mut response = Response {
                status,
                reason: parsed.reason.unwrap_or_default().to_string(),
                minor: parsed.version.unwrap_or(1) as u8,
                headers: parsed
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect(),
                body: Vec::new(),
                eof_delimited: false,
            };

            // Interim responses carry no body; wait for the real one.
            if (100..200).contains(&status) {
                continue;
            }

            if head_request || status == 204 || status == 304 {
                return Ok(response);
            }

            if let Some(te) = response.header("transfer-encoding") {
                if te.to_ascii_lowercase().contains("chunked") {
                    response.body = self.read_chunked_body(stream, MAX_RESPONSE_BODY).await?;
                    let headers = &mut response.headers;
                    headers.retain(|(n, _)| !n.eq_ignore_ascii_case("transfer-encoding"));
                    headers.push(("Content-Length".into(), response.body.len().to_string()));
                    return Ok(response);
                }
            }

            if let Some(length) = response.header("content-length") {
                let length: usize = length
                    .trim()
                    .parse()
                    .map_err(|_| Error::protocol("bad content-length"))?;
                if length > MAX_RESPONSE_BODY {
                    return Err(Error::protocol("response body too large"));
                }
                response.body = self.read_exact_body(stream, length).await?;
                return Ok(response);
            }

            // No framing: body runs to EOF.
            loop {
                if self.buf.len() > MAX_RESPONSE_BODY {
                    return Err(Error::protocol("response body too large"));
                }
                if self.fill(stream).await? == 0 {
                    break;
                }
            }
            response.body = std::mem::take(&mut self.buf);
            response.eof_delimited = true;
            return Ok(response);
        }
    }
}

/// Outcome of proxy authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAuth {
    Success,
    Failed,
    None,
    Illegal,
}

/// Check a `Proxy-Authorization` header against the configured users.
pub fn authorize(
    options: &crate::server::config::ServerOptions,
    header: Option<&str>,
) -> ProxyAuth {
    if !options.auth_required() {
        return ProxyAuth::Success;
    }
    let Some(value) = header else {
        return ProxyAuth::None;
    };
    let Some((scheme, token)) = value.split_once(' ') else {
        return ProxyAuth::Illegal;
    };
    if !scheme.eq_ignore_ascii_case("Basic") {
        return ProxyAuth::Illegal;
    }
    let Ok(decoded) = BASE64.decode(token.trim()) else {
        return ProxyAuth::Illegal;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return ProxyAuth::Illegal;
    };
    let Some((username, password)) = text.split_once(':') else {
        return ProxyAuth::Illegal;
    };

    if options.check_credentials(username, password) {
        ProxyAuth::Success
    } else {
        ProxyAuth::Failed
    }
}

pub(crate) fn nginx_body(title: &str) -> String {
    format!(
        "<html>\r\n<head><title>{title}</title></head>\r\n<body bgcolor=\"white\">\r\n\
         <center><h1>{title}</h1></center>\r\n<hr><center>{SERVER_NAME}</center>\r\n\
         </body>\r\n</html>"
    )
}

fn full_error_page(status: u16, reason: &str) -> Vec<u8> {
    let body = nginx_body(&format!("{status} {reason}"));
    format!(
        "HTTP/1.1 {status} {reason}\r\nServer: {SERVER_NAME}\r\nDate: {}\r\n\
         Content-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        http_date(),
        body.len()
    )
    .into_bytes()
}

/// Canned responses disguising the proxy as an nginx origin.
pub fn page_400() -> Vec<u8> {
    full_error_page(400, "Bad Request")
}

pub fn page_404() -> Vec<u8> {
    full_error_page(404, "Not Found")
}

pub fn page_407() -> Vec<u8> {
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nServer: {SERVER_NAME}\r\nDate: {}\r\n\
         Connection: close\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\n\
         Proxy-Connection: close\r\nContent-Length: 0\r\n\r\n",
        http_date()
    )
    .into_bytes()
}

/// Serve a connection classified as HTTP.
pub async fn serve(ctx: &ServeContext, mut stream: ProxyStream) -> Result<()> {
    if ctx.options.disable_http {
        return Err(Error::PolicyDenied("http disabled"));
    }

    let mut reader = MessageReader::new();
    let Some(request) = reader.read_request(&mut stream).await? else {
        return Ok(());
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        // Bytes the client pipelined behind the header belong to the tunnel.
        let leftover = reader.into_leftover();
        if !leftover.is_empty() {
            stream.unread(&leftover);
        }
        serve_connect(ctx, stream, request).await
    } else {
        serve_forward(ctx, stream, reader, request).await
    }
}

fn split_authority(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

async fn serve_connect(
    ctx: &ServeContext,
    mut stream: ProxyStream,
    request: Request,
) -> Result<()> {
    let id = ctx.session.id();

    let auth = authorize(&ctx.options, request.header("proxy-authorization"));
    if auth != ProxyAuth::Success {
        tracing::debug!("connection id: {id}, CONNECT auth {auth:?}");
        stream.write_all(&page_407()).await?;
        return Err(Error::Auth);
    }

    let Some((host, port)) = split_authority(&request.target) else {
        tracing::debug!("connection id: {id}, illegal CONNECT target {}", request.target);
        stream.write_all(&page_400()).await?;
        return Err(Error::protocol("bad CONNECT target"));
    };

    tracing::debug!("connection id: {id}, CONNECT {host}:{port}");

    let outbound =
        match connect::establish(id, &host, port, true, &ctx.options, &ctx.tls_client).await {
            Ok(outbound) => outbound,
            Err(err) => {
                stream.write_all(&page_400()).await?;
                return Err(err);
            }
        };

    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    let (up, down) = relay::run(ctx.session.clone(), stream, outbound.stream).await;
    ctx.session.add_transfer(up, down);
    tracing::debug!("connection id: {id}, transfer completed");
    Ok(())
}

fn parse_proxy_target(target: &str) -> Option<(Url, String, u16)> {
    let url = Url::parse(target).ok()?;
    let host = url.host_str()?.to_string();
    let port = url
        .port()
        .unwrap_or(match url.scheme() {
            "https" => 443,
            _ => 80,
        });
    Some((url, host, port))
}

/// Rewrite an absolute-form proxy request into origin form.
fn rewrite_for_origin(request: &mut Request, url: &Url) {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    request.target = target;

    request.set_header("Host", url.host_str().unwrap_or_default().to_string());

    if request.header("connection").is_none() {
        if let Some(value) = request.header("proxy-connection").map(str::to_string) {
            request.set_header("Connection", value);
        }
    }
    request.remove_header("proxy-authorization");
    request.remove_header("proxy-connection");
}

async fn serve_forward(
    ctx: &ServeContext,
    mut stream: ProxyStream,
    mut reader: MessageReader,
    first_request: Request,
) -> Result<()> {
    let id = ctx.session.id();
    let mut pending = Some(first_request);
    let mut first = true;
    let mut upstream: Option<(ProxyStream, MessageReader, String)> = None;

    while !ctx.session.is_aborted() {
        let mut request = match pending.take() {
            Some(request) => request,
            None => match reader.read_request(&mut stream).await? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        let keep_alive = request.keep_alive();
        let auth = authorize(&ctx.options, request.header("proxy-authorization"));
        let target = parse_proxy_target(&request.target);

        tracing::debug!(
            "connection id: {id}, method: {}, target: {}",
            request.method,
            request.target
        );

        let Some((url, host, port)) = target else {
            // Not an absolute-form target: the static site takes over when
            // configured.
            if ctx.options.doc_root.is_some() {
                return files::serve(ctx, stream, reader, request).await;
            }
            if first {
                stream.write_all(&page_400()).await?;
            }
            return Err(Error::protocol("not an absolute-form target"));
        };

        if auth != ProxyAuth::Success {
            // A proxy request with bad credentials is closed, never served
            // from the document root.
            tracing::debug!("connection id: {id}, proxy auth {auth:?}");
            if first {
                stream.write_all(&page_400()).await?;
            }
            return Err(Error::Auth);
        }

        // Reuse the upstream connection only for the same origin.
        let origin = format!("{host}:{port}");
        if upstream.as_ref().map(|(_, _, o)| o.as_str()) != Some(origin.as_str()) {
            upstream = None;
            let outbound =
                match connect::establish(id, &host, port, true, &ctx.options, &ctx.tls_client)
                    .await
                {
                    Ok(outbound) => outbound,
                    Err(err) => {
                        if first {
                            stream.write_all(&page_400()).await?;
                        }
                        return Err(err);
                    }
                };
            upstream = Some((outbound.stream, MessageReader::new(), origin.clone()));
        }

        let head_request = request.method.eq_ignore_ascii_case("HEAD");
        rewrite_for_origin(&mut request, &url);

        let Some((remote, remote_reader, _)) = upstream.as_mut() else {
            return Err(Error::Connect("no upstream connection".into()));
        };
        remote.write_all(&request.encode()).await?;

        let response = remote_reader.read_response(remote, head_request).await?;
        stream.write_all(&response.encode()).await?;

        tracing::debug!(
            "connection id: {id}, {} -> {} for {}",
            request.method,
            response.status,
            origin
        );

        if response.eof_delimited {
            // Client needs EOF to delimit the body we just forwarded.
            return Ok(());
        }
        if !response.keep_alive() {
            upstream = None;
        }

        first = false;
        if !keep_alive {
            return Ok(());
        }
    }

    Err(Error::Aborted)
}
