//! Static file service under `doc_root`.
//!
//! The fallthrough surface for requests that are not proxy requests: plain
//! files with single-range support, optional autoindex directory listings,
//! and the same nginx-styled error pages as the proxy handlers.

use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::http::{http_date, nginx_body, page_400, page_404, MessageReader, Request, SERVER_NAME};
use crate::server::ServeContext;
use crate::stream::ProxyStream;

const FILE_CHUNK: usize = 64 * 1024;
const NAME_COLUMN: usize = 50;

const INDEX_HEAD: &str = r#"<html><head><meta charset="UTF-8"><title>Index of {}</title></head><body bgcolor="white"><h1>Index of {}</h1><hr><pre>"#;
const INDEX_TAIL: &str = "</pre><hr></body></html>";

/// Serve the keep-alive web loop starting from an already-parsed request.
pub async fn serve(
    ctx: &ServeContext,
    mut stream: ProxyStream,
    mut reader: MessageReader,
    first_request: Request,
) -> Result<()> {
    let id = ctx.session.id();
    let Some(doc_root) = ctx.options.doc_root.clone() else {
        stream.write_all(&page_400()).await?;
        return Err(Error::PolicyDenied("no document root"));
    };

    let mut pending = Some(first_request);

    while !ctx.session.is_aborted() {
        let request = match pending.take() {
            Some(request) => request,
            None => match reader.read_request(&mut stream).await? {
                Some(request) => request,
                None => return Ok(()),
            },
        };
        let keep_alive = request.keep_alive();

        if request
            .header("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
        {
            write_simple(&mut stream, 405, "Method Not Allowed", &[], "", false).await?;
            return Ok(());
        }
        if is_upgrade(&request) {
            stream.write_all(&page_404()).await?;
            return Ok(());
        }

        tracing::debug!("connection id: {id}, web {} {}", request.method, request.target);

        let raw_target = request.target.split('?').next().unwrap_or("/").to_string();
        let Some(fs_path) = sanitize_path(&doc_root, &raw_target) else {
            stream.write_all(&page_404()).await?;
            return Ok(());
        };

        let handled = if raw_target.ends_with('/') {
            serve_dir(ctx, &mut stream, &request, &fs_path, &raw_target, keep_alive).await?
        } else {
            serve_file(ctx, &mut stream, &request, &fs_path, &raw_target, keep_alive).await?
        };
        if !handled {
            return Ok(());
        }

        if !keep_alive {
            return Ok(());
        }
    }

    Err(Error::Aborted)
}

fn is_upgrade(request: &Request) -> bool {
    request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Join the decoded target onto the document root, refusing traversal.
fn sanitize_path(doc_root: &Path, target: &str) -> Option<PathBuf> {
    let decoded = percent_decode_str(target).decode_utf8().ok()?;

    let mut path = doc_root.to_path_buf();
    for part in decoded.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            part => path.push(part),
        }
    }
    Some(path)
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "application/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "txt" | "md" | "log" => "text/plain; charset=utf-8",
        "xml" => "text/xml",
        "ico" => "image/x-icon",
        "ttf" => "application/x-font-ttf",
        "woff" => "application/x-font-woff",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "wav" => "audio/x-wav",
        "ogg" => "video/ogg",
        "mp4" => "video/mp4",
        "flv" => "video/x-flv",
        "ts" => "video/MP2T",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "3gp" => "video/3gpp",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "7z" => "application/x-7z-compressed",
        "zip" => "application/zip",
        "xz" => "application/x-xz",
        _ => "text/plain",
    }
}

enum Range {
    /// Whole file.
    Full,
    /// Inclusive byte range.
    Partial(u64, u64),
    /// Not satisfiable.
    Invalid,
}

fn parse_range(header: Option<&str>, len: u64) -> Range {
    let Some(header) = header else {
        return Range::Full;
    };
    let spec = header.replace(' ', "");
    let Some(spec) = spec
        .strip_prefix("bytes=")
        .or_else(|| spec.strip_prefix("Bytes="))
    else {
        return Range::Full;
    };

    // Single range only; multipart ranges are not produced.
    let spec = spec.split(',').next().unwrap_or("");
    let Some((start, end)) = spec.split_once('-') else {
        return Range::Full;
    };

    let (start, end) = match (start, end) {
        ("", suffix) => match suffix.parse::<u64>() {
            // Last N bytes.
            Ok(n) if n > 0 => (len.saturating_sub(n), len.saturating_sub(1)),
            _ => return Range::Full,
        },
        (start, "") => match start.parse::<u64>() {
            Ok(s) => (s, len.saturating_sub(1)),
            Err(_) => return Range::Full,
        },
        (start, end) => match (start.parse::<u64>(), end.parse::<u64>()) {
            (Ok(s), Ok(e)) => (s, e),
            _ => return Range::Full,
        },
    };

    if len == 0 || start >= len || end < start {
        return Range::Invalid;
    }
    Range::Partial(start, end.min(len - 1))
}

async fn write_simple(
    stream: &mut ProxyStream,
    status: u16,
    reason: &str,
    extra_headers: &[(&str, String)],
    body: &str,
    keep_alive: bool,
) -> Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nServer: {SERVER_NAME}\r\nDate: {}\r\n\
         Content-Type: text/html\r\nContent-Length: {}\r\n",
        http_date(),
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body.as_bytes()).await?;
    Ok(())
}

/// Serve a file target. Returns whether the connection may continue.
async fn serve_file(
    ctx: &ServeContext,
    stream: &mut ProxyStream,
    request: &Request,
    fs_path: &Path,
    target: &str,
    keep_alive: bool,
) -> Result<bool> {
    let id = ctx.session.id();

    let metadata = match fs::metadata(fs_path).await {
        Ok(metadata) => metadata,
        Err(_) => {
            tracing::debug!("connection id: {id}, web {target} not found");
            stream.write_all(&page_404()).await?;
            return Ok(false);
        }
    };

    if metadata.is_dir() {
        // Directory targets need the trailing slash.
        let host = request.header("host").unwrap_or("localhost");
        let scheme = if stream.is_tls() { "https" } else { "http" };
        let location = format!("{scheme}://{host}{target}/");
        write_simple(
            stream,
            301,
            "Moved Permanently",
            &[("Location", location)],
            &nginx_body("301 Moved Permanently"),
            true,
        )
        .await?;
        return Ok(true);
    }

    let total = metadata.len();
    let (status, reason, start, length) = match parse_range(request.header("range"), total) {
        Range::Full => (200, "OK", 0, total),
        Range::Partial(start, end) => (206, "Partial Content", start, end - start + 1),
        Range::Invalid => {
            write_simple(
                stream,
                416,
                "Requested Range Not Satisfiable",
                &[],
                &nginx_body("416 Requested Range Not Satisfiable"),
                true,
            )
            .await?;
            return Ok(true);
        }
    };

    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nServer: {SERVER_NAME}\r\nDate: {}\r\n\
         Content-Type: {}\r\nContent-Length: {length}\r\n",
        http_date(),
        mime_for(fs_path)
    );
    if status == 200 {
        head.push_str("Accept-Ranges: bytes\r\n");
    } else {
        head.push_str(&format!(
            "Content-Range: bytes {start}-{}/{total}\r\n",
            start + length - 1
        ));
    }
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });
    stream.write_all(head.as_bytes()).await?;

    if request.method.eq_ignore_ascii_case("HEAD") {
        return Ok(true);
    }

    let mut file = fs::File::open(fs_path).await?;
    if start > 0 {
        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }

    let mut remaining = length;
    let mut buf = vec![0u8; FILE_CHUNK];
    while remaining > 0 && !ctx.session.is_aborted() {
        let want = (remaining as usize).min(FILE_CHUNK);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }

    tracing::debug!("connection id: {id}, web {target}, {length} bytes, completed");
    Ok(true)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn listing_row(href: &str, name: &str, mtime: &str, size: &str) -> String {
    let mut shown = name.to_string();
    if shown.len() > NAME_COLUMN {
        shown.truncate(NAME_COLUMN - 3);
        shown.push_str("..&gt;");
    }
    let pad = " ".repeat(NAME_COLUMN.saturating_sub(shown.len()));
    format!("<a href=\"{href}\">{shown}</a>{pad} {mtime}       {size}\r\n")
}

/// Serve a directory target. Returns whether the connection may continue.
async fn serve_dir(
    ctx: &ServeContext,
    stream: &mut ProxyStream,
    _request: &Request,
    fs_path: &Path,
    target: &str,
    keep_alive: bool,
) -> Result<bool> {
    let id = ctx.session.id();

    if !ctx.options.autoindex {
        if fs::metadata(fs_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            tracing::debug!("connection id: {id}, web {target} listing forbidden");
            write_simple(
                stream,
                403,
                "Forbidden",
                &[],
                &nginx_body("403 Forbidden"),
                true,
            )
            .await?;
            return Ok(true);
        }
        stream.write_all(&page_404()).await?;
        return Ok(false);
    }

    let mut entries = match fs::read_dir(fs_path).await {
        Ok(entries) => entries,
        Err(_) => {
            // Unreadable directory: bounce to the site root.
            write_simple(
                stream,
                302,
                "Found",
                &[("Location", "/".to_string())],
                "",
                true,
            )
            .await?;
            return Ok(true);
        }
    };

    let mut dirs: Vec<(String, String)> = Vec::new();
    let mut files: Vec<(String, String, u64)> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let mtime = metadata
            .modified()
            .ok()
            .map(|time| {
                chrono::DateTime::<chrono::Local>::from(time)
                    .format("%m-%d-%Y %H:%M")
                    .to_string()
            })
            .unwrap_or_default();
        if metadata.is_dir() {
            dirs.push((name, mtime));
        } else {
            files.push((name, mtime, metadata.len()));
        }
    }
    dirs.sort();
    files.sort();

    let mut body = INDEX_HEAD.replace("{}", target);
    body.push_str(&listing_row("../", "../", "", ""));
    for (name, mtime) in &dirs {
        let shown = format!("{name}/");
        body.push_str(&listing_row(&shown, &shown, mtime, "-"));
    }
    for (name, mtime, size) in &files {
        body.push_str(&listing_row(name, name, mtime, &human_size(*size)));
    }
    body.push_str(INDEX_TAIL);

    write_simple(stream, 200, "OK", &[], &body, keep_alive).await?;
    tracing::debug!("connection id: {id}, web {target} listed {} entries", dirs.len() + files.len());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};

    use crate::server::config::ServerOptions;
    use crate::server::session::Registry;
    use crate::stream::ScrambledStream;

    #[test]
    fn test_sanitize_path() {
        let root = Path::new("/srv/www");
        assert_eq!(
            sanitize_path(root, "/a/b.txt"),
            Some(PathBuf::from("/srv/www/a/b.txt"))
        );
        assert_eq!(sanitize_path(root, "/"), Some(PathBuf::from("/srv/www")));
        assert_eq!(
            sanitize_path(root, "/a%20b.txt"),
            Some(PathBuf::from("/srv/www/a b.txt"))
        );
        assert_eq!(sanitize_path(root, "/../etc/passwd"), None);
        assert_eq!(sanitize_path(root, "/a/../../x"), None);
    }

    #[test]
    fn test_parse_range() {
        assert!(matches!(parse_range(None, 100), Range::Full));
        assert!(matches!(
            parse_range(Some("bytes=0-49"), 100),
            Range::Partial(0, 49)
        ));
        assert!(matches!(
            parse_range(Some("bytes=50-"), 100),
            Range::Partial(50, 99)
        ));
        assert!(matches!(
            parse_range(Some("bytes=-10"), 100),
            Range::Partial(90, 99)
        ));
        // End clamps to the file size.
        assert!(matches!(
            parse_range(Some("bytes=90-500"), 100),
            Range::Partial(90, 99)
        ));
        assert!(matches!(parse_range(Some("bytes=60-50"), 100), Range::Invalid));
        assert!(matches!(parse_range(Some("bytes=200-"), 100), Range::Invalid));
    }

    #[test]
    fn test_mime_table() {
        assert_eq!(mime_for(Path::new("x.html")), "text/html; charset=utf-8");
        assert_eq!(mime_for(Path::new("x.PNG")), "image/png");
        assert_eq!(mime_for(Path::new("x.mkv")), "video/x-matroska");
        assert_eq!(mime_for(Path::new("x.unknown")), "text/plain");
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512");
        assert_eq!(human_size(2048), "2.0K");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0M");
    }

    struct WebFixture {
        client: TcpStream,
        _root: PathBuf,
    }

    async fn start_web(autoindex: bool) -> WebFixture {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT_ROOT: AtomicUsize = AtomicUsize::new(0);

        let root = std::env::temp_dir().join(format!(
            "veilproxy-web-test-{}-{}",
            std::process::id(),
            NEXT_ROOT.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("hello.txt"), b"hello world").unwrap();
        std::fs::write(root.join("sub/page.html"), b"<html></html>").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (accepted, peer) = accepted.unwrap();

        let options = Arc::new(ServerOptions {
            doc_root: Some(root.clone()),
            autoindex,
            ..Default::default()
        });
        let tls_client = crate::tls::client_config(&options.tls).unwrap();
        let registry = Registry::new();
        let ctx = ServeContext {
            session: registry.create(peer),
            options,
            tls_client,
        };

        tokio::spawn(async move {
            let mut stream = ProxyStream::plain(ScrambledStream::new(accepted));
            let mut reader = MessageReader::new();
            let Ok(Some(first)) = reader.read_request(&mut stream).await else {
                return;
            };
            let _ = serve(&ctx, stream, reader, first).await;
        });

        WebFixture {
            client: client.unwrap(),
            _root: root,
        }
    }

    async fn response_text(client: &mut TcpStream) -> String {
        let mut reader = MessageReader::new();
        let response = reader.read_response(client, false).await.unwrap();
        let mut text = format!("{} {}\n", response.status, response.reason);
        text.push_str(&String::from_utf8_lossy(&response.body));
        text
    }

    #[tokio::test]
    async fn test_get_file_and_keep_alive() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.starts_with("200 OK"));
        assert!(text.contains("hello world"));

        // Second request on the same connection.
        client
            .write_all(b"GET /sub/page.html HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.contains("<html></html>"));
    }

    #[tokio::test]
    async fn test_range_request() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: site\r\nRange: bytes=6-10\r\n\r\n")
            .await
            .unwrap();

        let mut reader = MessageReader::new();
        let response = reader.read_response(client, false).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.header("content-range"), Some("bytes 6-10/11"));
        assert_eq!(response.body, b"world");
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: site\r\nRange: bytes=50-40\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.starts_with("416 "));
    }

    #[tokio::test]
    async fn test_missing_file_404() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /nope.txt HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.starts_with("404 "));
    }

    #[tokio::test]
    async fn test_directory_redirect_and_listing() {
        let mut fixture = start_web(true).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /sub HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let mut reader = MessageReader::new();
        let response = reader.read_response(client, false).await.unwrap();
        assert_eq!(response.status, 301);
        assert_eq!(response.header("location"), Some("http://site/sub/"));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let response = reader.read_response(client, false).await.unwrap();
        assert_eq!(response.status, 200);
        let body = String::from_utf8_lossy(&response.body);
        assert!(body.contains("Index of /"));
        assert!(body.contains("href=\"../\""));
        assert!(body.contains("href=\"sub/\""));
        assert!(body.contains("href=\"hello.txt\""));
    }

    #[tokio::test]
    async fn test_listing_forbidden_without_autoindex() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /sub/ HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.starts_with("403 "));
    }

    #[tokio::test]
    async fn test_traversal_blocked() {
        let mut fixture = start_web(false).await;
        let client = &mut fixture.client;

        client
            .write_all(b"GET /../../etc/passwd HTTP/1.1\r\nHost: site\r\n\r\n")
            .await
            .unwrap();
        let text = response_text(client).await;
        assert!(text.starts_with("404 "));
    }
}
