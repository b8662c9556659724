//! Just enough HTTP/1.1 to split upgrades from page requests.
//!
//! The listener reads the request head off the raw stream before deciding
//! what the connection is; upgrade requests are replayed into the websocket
//! handshake, everything else gets a facade response here.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a request head. Anything longer is dropped unanswered.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

const LANDING_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>manifold</title></head>
<body>
<h1>manifold</h1>
<p>WebSocket tunneling gateway. Connect a tunnel client to the configured
websocket path to open TCP streams and UDP flows.</p>
</body>
</html>
"#;

#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parses a request head out of `buf`, which must contain the complete
    /// `\r\n\r\n`-terminated head (trailing body bytes are ignored).
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let end = find_head_end(buf)?;
        let head = std::str::from_utf8(&buf[..end - 4]).ok()?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") || parts.next().is_some() {
            return None;
        }

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':')?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        Some(Self {
            method,
            path,
            headers,
        })
    }

    /// First value of a header, by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_upgrade(&self) -> bool {
        self.method == "GET"
            && self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }
}

/// Reads from `stream` until a complete request head is buffered. Returns
/// `None` on EOF before the head terminator or when the head exceeds
/// [`MAX_HEAD_BYTES`]; the returned buffer may extend past the head.
pub async fn read_head<S>(stream: &mut S) -> std::io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        if find_head_end(&buf).is_some() {
            return Ok(Some(buf));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Ok(None);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

pub fn facade_response(path: &str) -> String {
    if path == "/" {
        raw_response("200 OK", "text/html; charset=utf-8", LANDING_PAGE)
    } else {
        raw_response("404 Not Found", "text/plain; charset=utf-8", "not found\n")
    }
}

pub fn deny_forbidden() -> String {
    raw_response("403 Forbidden", "text/plain; charset=utf-8", "forbidden\n")
}

pub fn deny_unauthorized() -> String {
    raw_response("401 Unauthorized", "text/plain; charset=utf-8", "unauthorized\n")
}

fn raw_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPGRADE: &[u8] = b"GET /ws HTTP/1.1\r\nHost: gw\r\nConnection: Upgrade\r\nUpgrade: WebSocket\r\nSec-WebSocket-Protocol: secret\r\n\r\n";

    #[test]
    fn parses_an_upgrade_request() {
        let head = RequestHead::parse(UPGRADE).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/ws");
        assert!(head.is_upgrade());
        assert_eq!(head.header("sec-websocket-protocol"), Some("secret"));
        assert_eq!(head.header("host"), Some("gw"));
    }

    #[test]
    fn plain_get_is_not_an_upgrade() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: gw\r\n\r\n").unwrap();
        assert!(!head.is_upgrade());
        assert_eq!(head.path, "/");
    }

    #[test]
    fn rejects_garbage_and_incomplete_heads() {
        assert!(RequestHead::parse(b"GET /ws HTTP/1.1\r\nHost: gw\r\n").is_none());
        assert!(RequestHead::parse(b"\xff\xfe\r\n\r\n").is_none());
        assert!(RequestHead::parse(b"GET /ws\r\n\r\n").is_none());
        assert!(RequestHead::parse(b"GET /ws HTTP/1.1 extra\r\n\r\n").is_none());
        assert!(RequestHead::parse(b"GET /ws HTTP/1.1\r\nbroken-header\r\n\r\n").is_none());
    }

    #[test]
    fn body_bytes_after_the_head_are_ignored() {
        let mut buf = UPGRADE.to_vec();
        buf.extend_from_slice(b"leftover");
        let head = RequestHead::parse(&buf).unwrap();
        assert_eq!(head.path, "/ws");
    }

    #[tokio::test]
    async fn read_head_stops_at_the_terminator() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, UPGRADE).await.unwrap();
        let buf = read_head(&mut b).await.unwrap().unwrap();
        assert_eq!(buf, UPGRADE);
    }

    #[tokio::test]
    async fn read_head_gives_up_on_oversized_heads() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let big = vec![b'x'; MAX_HEAD_BYTES + 16];
        tokio::io::AsyncWriteExt::write_all(&mut a, &big).await.unwrap();
        assert!(read_head(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn facade_serves_landing_and_not_found() {
        assert!(facade_response("/").starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(facade_response("/").contains("manifold"));
        assert!(facade_response("/anything").starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(deny_forbidden().starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(deny_unauthorized().starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    }
}
